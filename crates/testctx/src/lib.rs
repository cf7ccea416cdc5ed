#![doc = r#"
# testctx

## 设计动机（Why）
- 测试体常常需要一个“随测试结束必然取消”的上下文，并希望子测试自动继承父级的上下文、
  超时、并行与追踪等横切逻辑；
- 本 crate 把运行单元包装为 [`W`]，以中间件组合这些横切逻辑，并提供参考宿主 [`host`]
  在进程内执行带层级的测试树。

## 核心契约（What）
- [`Context`]：不可变、可取消、携带类型化值的传播链；
- [`Unit`]/[`Runner`]/[`ParallelUnit`]：运行单元需要具备的能力；
- [`W`]：上下文感知包装器，别名 [`T`]（测试）与 [`B`]（基准）；
- [`Middleware`]/[`RunFn`]：测试体变换与其组合规则，内置 [`middleware::timeout`]、
  [`middleware::parallel`]、[`middleware::instrumentation`]、[`middleware::log_to`]；
- [`Suite`] 与 [`suite`](macro@suite) 属性宏：按方法名前缀批量运行套件方法。

## 快速上手（How）
```
use std::time::Duration;
use testctx::{Context, T, host, middleware};

host::test("TestQuickStart", |unit| {
    let t = T::new(unit, &Context::background(), vec![middleware::timeout(Duration::from_secs(5))]);
    t.run("child", |ctx, t| {
        assert!(ctx.deadline().is_some());
        t.log("running with a deadline");
    });
});
```
"#]

extern crate self as testctx;

pub mod context;
pub mod contract;
pub mod host;
pub mod logger;
pub mod middleware;
pub mod suite;
pub mod wrapper;

pub use context::{CancelGuard, CancelHandle, Context, ContextError};
pub use contract::{ParallelUnit, Runner, Unit};
pub use logger::{LogEntry, LogLevel, Logger, RecordingLogger, TracingLogger};
pub use middleware::{Middleware, RunFn, compose};
pub use suite::{BENCH_PREFIX, Suite, SuiteMethod, SuiteSet, TEST_PREFIX};
pub use testctx_macros::suite;
pub use wrapper::W;

use host::{BenchUnit, TestUnit};

/// 单元测试包装器。
pub type T = W<TestUnit>;

/// 基准测试包装器。
pub type B = W<BenchUnit>;

/// 单元测试中间件。
pub type TestMiddleware = Middleware<TestUnit>;

/// 基准测试中间件。
pub type BenchMiddleware = Middleware<BenchUnit>;

/// 单元测试体。
pub type TestFn = RunFn<TestUnit>;

/// 基准测试体。
pub type BenchFn = RunFn<BenchUnit>;

/// 常用类型的一次性导入。
pub mod prelude {
    pub use crate::{
        B, BenchFn, BenchMiddleware, Context, ContextError, Logger, Middleware, ParallelUnit, RunFn,
        Runner, Suite, SuiteSet, T, TestFn, TestMiddleware, Unit, W, middleware, suite,
    };
}
