//! 套件：把一组方法作为具名子单元批量运行。
//!
//! 方法表通常由 [`suite`](macro@crate::suite) 属性宏在编译期生成：宏扫描 `impl` 块，挑出形如
//! `fn test_x(&self, ctx: Context, t: T)` 的方法，并按声明顺序生成 [`Suite::methods`]。
//! 也可以手写实现，以便在运行时拼装方法表。

use std::{fmt, sync::Arc};

use crate::{context::Context, contract::Runner, middleware::RunFn, wrapper::W};

/// [`W::run_tests`] 使用的方法名前缀。
pub const TEST_PREFIX: &str = "test";

/// [`W::run_benchmarks`] 使用的方法名前缀。
pub const BENCH_PREFIX: &str = "bench";

/// 可被包装器分发的方法集合。
///
/// 方法按 `methods` 返回的顺序运行；名称即子单元名。
pub trait Suite<U: Runner>: Send + Sync + Sized + 'static {
    fn methods() -> Vec<SuiteMethod<Self, U>>;
}

/// 套件中的单个方法：名称与接收 `(&套件, 上下文, 包装器)` 的函数指针。
pub struct SuiteMethod<S, U: Runner> {
    name: &'static str,
    call: fn(&S, Context, W<U>),
}

impl<S, U: Runner> SuiteMethod<S, U> {
    pub const fn new(name: &'static str, call: fn(&S, Context, W<U>)) -> Self {
        Self { name, call }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn call(&self, suite: &S, ctx: Context, w: W<U>) {
        (self.call)(suite, ctx, w)
    }
}

impl<S, U: Runner> Clone for SuiteMethod<S, U> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, U: Runner> Copy for SuiteMethod<S, U> {}

impl<S, U: Runner> fmt::Debug for SuiteMethod<S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteMethod").field("name", &self.name).finish()
    }
}

/// 按加入顺序拼接多个套件容器的方法，交给 [`W::run_suites`] 在同一个分发循环中运行。
///
/// 容器类型可以互不相同；每个方法在加入时即绑定到自己的容器实例。
pub struct SuiteSet<U: Runner> {
    methods: Vec<(&'static str, RunFn<U>)>,
}

impl<U: Runner> SuiteSet<U> {
    pub fn new() -> Self {
        Self { methods: Vec::new() }
    }

    /// 追加一个套件容器。
    pub fn with<S: Suite<U>>(self, suite: S) -> Self {
        self.with_shared(Arc::new(suite))
    }

    /// 追加一个已共享的套件容器。
    pub fn with_shared<S: Suite<U>>(mut self, suite: Arc<S>) -> Self {
        for method in <S as Suite<U>>::methods() {
            let suite = Arc::clone(&suite);
            let run = RunFn::new(move |ctx: Context, w: W<U>| method.call(&suite, ctx, w));
            self.methods.push((method.name(), run));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// 全部方法名，保持加入顺序。
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.iter().map(|(name, _)| *name)
    }

    pub(crate) fn matching<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'static str, &'a RunFn<U>)> + 'a {
        self.methods
            .iter()
            .filter(move |(name, _)| name.starts_with(prefix))
            .map(|(name, run)| (*name, run))
    }
}

impl<U: Runner> Default for SuiteSet<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U: Runner> Clone for SuiteSet<U> {
    fn clone(&self) -> Self {
        Self {
            methods: self.methods.clone(),
        }
    }
}

impl<U: Runner> fmt::Debug for SuiteSet<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
