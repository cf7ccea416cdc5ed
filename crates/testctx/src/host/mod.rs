//! 参考宿主：在进程内以线程树运行测试与基准单元。
//!
//! 它为 `#[test]` 函数提供完整的子测试语义（命名层级、同步子单元、并行暂停、
//! `fatal`/`skip` 立即终止、LIFO 清理），并把结果汇总为 [`Report`]：
//!
//! ```
//! use testctx::{Context, T, host};
//!
//! let report = host::run_test("Example", |unit| {
//!     let t = T::new(unit, &Context::background(), Vec::new());
//!     t.run("child", |_ctx, t| t.log("hello"));
//! });
//! assert!(report.passed());
//! assert_eq!(report.names(), vec!["Example", "Example/child"]);
//! ```

mod node;
mod options;
mod report;

use std::sync::Arc;

pub use options::{BENCH_ITERATIONS_ENV, HostOptions, VERBOSE_ENV};
pub use report::{Outcome, Report};

use crate::contract::{ParallelUnit, Runner, Unit};
use node::Node;

/// 以固定参数运行根单元的宿主。
#[derive(Clone, Debug, Default)]
pub struct Host {
    options: HostOptions,
}

impl Host {
    pub fn new(options: HostOptions) -> Self {
        Self { options }
    }

    /// 以环境变量覆盖默认参数，参见 [`HostOptions::from_env`]。
    pub fn from_env() -> Self {
        Self::new(HostOptions::from_env())
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    pub fn run_test<F>(&self, name: &str, body: F) -> Report
    where
        F: FnOnce(TestUnit) + Send + 'static,
    {
        node::execute_root(name, self.options.clone(), move |node| body(TestUnit { node }))
    }

    pub fn run_benchmark<F>(&self, name: &str, body: F) -> Report
    where
        F: FnOnce(BenchUnit) + Send + 'static,
    {
        node::execute_root(name, self.options.clone(), move |node| body(BenchUnit { node }))
    }
}

/// 以环境配置运行根测试单元并返回报告。
pub fn run_test<F>(name: &str, body: F) -> Report
where
    F: FnOnce(TestUnit) + Send + 'static,
{
    Host::from_env().run_test(name, body)
}

/// 以环境配置运行根基准单元并返回报告。
pub fn run_benchmark<F>(name: &str, body: F) -> Report
where
    F: FnOnce(BenchUnit) + Send + 'static,
{
    Host::from_env().run_benchmark(name, body)
}

/// 运行根测试单元，失败时 panic 并输出报告。
#[track_caller]
pub fn test<F>(name: &str, body: F)
where
    F: FnOnce(TestUnit) + Send + 'static,
{
    run_test(name, body).assert_passed();
}

/// 运行根基准单元，失败时 panic 并输出报告。
#[track_caller]
pub fn bench<F>(name: &str, body: F)
where
    F: FnOnce(BenchUnit) + Send + 'static,
{
    run_benchmark(name, body).assert_passed();
}

/// 宿主提供的测试单元，支持并行。
#[derive(Clone)]
pub struct TestUnit {
    node: Arc<Node>,
}

/// 宿主提供的基准单元。
#[derive(Clone)]
pub struct BenchUnit {
    node: Arc<Node>,
}

impl BenchUnit {
    /// 基准循环应执行的迭代次数。
    pub fn n(&self) -> u64 {
        self.node.options.bench_iterations
    }
}

macro_rules! host_unit {
    ($unit:ident) => {
        impl Unit for $unit {
            fn name(&self) -> &str {
                self.node.name()
            }

            fn cleanup(&self, f: Box<dyn FnOnce() + Send + 'static>) {
                self.node.cleanup(f);
            }

            fn log(&self, message: &str) {
                self.node.log(message);
            }

            fn error(&self, message: &str) {
                self.node.error(message);
            }

            fn fatal(&self, message: &str) -> ! {
                self.node.fatal(message)
            }

            fn skip(&self, message: &str) -> ! {
                self.node.skip(message)
            }

            fn failed(&self) -> bool {
                self.node.failed()
            }

            fn skipped(&self) -> bool {
                self.node.skipped()
            }
        }

        impl Runner for $unit {
            fn run<F>(&self, name: &str, body: F) -> bool
            where
                F: FnOnce(Self) + Send + 'static,
            {
                self.node.spawn(name, move |node| body($unit { node }))
            }
        }

        impl std::fmt::Debug for $unit {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($unit))
                    .field("name", &self.node.name())
                    .finish()
            }
        }
    };
}

host_unit!(TestUnit);
host_unit!(BenchUnit);

impl ParallelUnit for TestUnit {
    fn parallel(&self) {
        self.node.pause_for_parallel();
    }
}
