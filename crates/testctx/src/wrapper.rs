use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{
    context::Context,
    contract::{Runner, Unit},
    logger::Logger,
    middleware::{Middleware, RunFn, compose},
    suite::{BENCH_PREFIX, Suite, SuiteSet, TEST_PREFIX},
};

/// 围绕运行单元的上下文感知包装器。
///
/// # 教案式说明
/// - **意图（Why）**：把“单元 + 可取消上下文 + 中间件链 + 可选日志镜像”绑定在一起，
///   让子测试自动继承父级的上下文与中间件。
/// - **逻辑（How）**：
///   - 克隆是句柄克隆，与原值共享中间件列表，[`W::use_middleware`] 对双方都可见；
///   - `with_context`/`using`/`with_logger` 以及 `run` 派生的子包装器都会复制一份列表快照，
///     之后的修改互不影响，兄弟子树因此彼此隔离；
///   - 每次 `run` 都在子单元上重新组合中间件，并把子上下文绑定为“父上下文的可取消派生”，
///     其取消函数注册为子单元的清理回调。
/// - **契约（What）**：
///   - 包装器的上下文保证在单元结束之前被取消；
///   - `fatal`/`skip` 先镜像到日志接收端再委托，其余记录方法先委托再镜像；
///   - 子单元中修改列表不会影响父级或兄弟单元。
pub struct W<U: Runner> {
    unit: U,
    ctx: Context,
    middleware: Arc<RwLock<Vec<Middleware<U>>>>,
    logger: Option<Arc<dyn Logger>>,
}

impl<U: Runner> Clone for W<U> {
    fn clone(&self) -> Self {
        Self {
            unit: self.unit.clone(),
            ctx: self.ctx.clone(),
            middleware: Arc::clone(&self.middleware),
            logger: self.logger.clone(),
        }
    }
}

/// 从 `base` 派生可取消上下文，并把取消注册为 `unit` 的清理回调。
fn bind_context<U: Unit>(unit: &U, base: &Context) -> Context {
    let (ctx, cancel) = base.with_cancel();
    unit.cleanup(Box::new(move || {
        cancel.cancel();
    }));
    ctx
}

impl<U: Runner> W<U> {
    /// 以 `base` 的可取消派生作为上下文，构造携带初始中间件的包装器。
    pub fn new(unit: U, base: &Context, middleware: impl IntoIterator<Item = Middleware<U>>) -> Self {
        let ctx = bind_context(&unit, base);
        Self {
            unit,
            ctx,
            middleware: Arc::new(RwLock::new(middleware.into_iter().collect())),
            logger: None,
        }
    }

    /// 复制当前状态并为中间件列表建立独立快照。
    fn branch(&self) -> Self {
        Self {
            unit: self.unit.clone(),
            ctx: self.ctx.clone(),
            middleware: Arc::new(RwLock::new(self.middleware.read().clone())),
            logger: self.logger.clone(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// 返回以 `ctx` 的可取消派生为上下文的新包装器。
    pub fn with_context(&self, ctx: &Context) -> Self {
        let mut derived = self.branch();
        derived.ctx = bind_context(&self.unit, ctx);
        derived
    }

    /// 返回追加了 `middleware` 的新包装器，原包装器不受影响。
    pub fn using(&self, middleware: impl IntoIterator<Item = Middleware<U>>) -> Self {
        let derived = self.branch();
        derived.middleware.write().extend(middleware);
        derived
    }

    /// 就地追加中间件，对共享同一列表的克隆可见，对已派生的子包装器不可见。
    pub fn use_middleware(&self, middleware: impl IntoIterator<Item = Middleware<U>>) {
        self.middleware.write().extend(middleware);
    }

    /// 返回挂接了日志镜像接收端的新包装器。
    pub fn with_logger(&self, logger: Arc<dyn Logger>) -> Self {
        let mut derived = self.branch();
        derived.logger = Some(logger);
        derived
    }

    pub fn logger(&self) -> Option<&Arc<dyn Logger>> {
        self.logger.as_ref()
    }

    /// 取回底层运行单元，用于调用包装器未覆盖的宿主能力。
    pub fn unit(&self) -> &U {
        &self.unit
    }

    pub fn name(&self) -> &str {
        self.unit.name()
    }

    /// 完整名最后一个 `/` 之后的部分。
    pub fn base_name(&self) -> &str {
        let name = self.name();
        name.rsplit_once('/').map_or(name, |(_, base)| base)
    }

    /// 以 `name` 运行子单元，子单元继承上下文与中间件。
    ///
    /// 返回值语义与 [`Runner::run`] 一致。
    pub fn run<F>(&self, name: &str, f: F) -> bool
    where
        F: Fn(Context, W<U>) + Send + Sync + 'static,
    {
        self.run_fn(name, RunFn::new(f))
    }

    pub fn run_fn(&self, name: &str, f: RunFn<U>) -> bool {
        let parent = self.branch();
        self.unit.run(name, move |unit: U| {
            let child = parent.rebind(unit);
            child.wrap(f).call(child.ctx.clone(), child);
        })
    }

    fn rebind(self, unit: U) -> Self {
        let ctx = bind_context(&unit, &self.ctx);
        Self { unit, ctx, ..self }
    }

    /// 组合当前中间件列表，终端会用收到的上下文刷新包装器后再调用 `f`。
    fn wrap(&self, f: RunFn<U>) -> RunFn<U> {
        let terminal = RunFn::new(move |ctx: Context, w: W<U>| {
            let w = w.with_context(&ctx);
            f.call(w.ctx.clone(), w);
        });
        let layers = self.middleware.read().clone();
        compose(&layers, terminal)
    }

    /// 以 [`TEST_PREFIX`] 运行套件方法。
    pub fn run_tests<S: Suite<U>>(&self, suite: S) {
        self.run_suites(SuiteSet::new().with(suite), TEST_PREFIX);
    }

    /// 以 [`BENCH_PREFIX`] 运行套件方法。
    pub fn run_benchmarks<S: Suite<U>>(&self, suite: S) {
        self.run_suites(SuiteSet::new().with(suite), BENCH_PREFIX);
    }

    /// 把名称以 `prefix` 开头的套件方法逐一作为子单元运行。
    pub fn run_suite<S: Suite<U>>(&self, suite: Arc<S>, prefix: &str) {
        self.run_suites(SuiteSet::new().with_shared(suite), prefix);
    }

    /// 在同一个分发循环中依次运行多个容器里名称以 `prefix` 开头的方法。
    ///
    /// 整个分发循环先经过当前中间件包裹一次并运行在当前单元上，随后每个方法再经由 `run`
    /// 成为独立子单元，因此中间件对外层循环作用一次，对每个方法各作用一次。
    pub fn run_suites(&self, suites: SuiteSet<U>, prefix: &str) {
        let prefix = prefix.to_owned();
        let dispatch = RunFn::new(move |_ctx: Context, w: W<U>| {
            for (name, run) in suites.matching(&prefix) {
                w.run_fn(name, run.clone());
            }
        });
        self.wrap(dispatch).call(self.ctx.clone(), self.clone());
    }

    pub fn cleanup<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.unit.cleanup(Box::new(f));
    }

    pub fn log(&self, message: &str) {
        self.unit.log(message);
        if let Some(logger) = &self.logger {
            logger.log(message);
        }
    }

    pub fn logf(&self, args: fmt::Arguments<'_>) {
        self.unit.log(&args.to_string());
        if let Some(logger) = &self.logger {
            logger.logf(args);
        }
    }

    pub fn error(&self, message: &str) {
        self.unit.error(message);
        if let Some(logger) = &self.logger {
            logger.error(message);
        }
    }

    pub fn errorf(&self, args: fmt::Arguments<'_>) {
        self.unit.error(&args.to_string());
        if let Some(logger) = &self.logger {
            logger.errorf(args);
        }
    }

    pub fn fatal(&self, message: &str) -> ! {
        if let Some(logger) = &self.logger {
            logger.error(message);
        }
        self.unit.fatal(message)
    }

    pub fn fatalf(&self, args: fmt::Arguments<'_>) -> ! {
        if let Some(logger) = &self.logger {
            logger.errorf(args);
        }
        self.unit.fatal(&args.to_string())
    }

    pub fn skip(&self, message: &str) -> ! {
        if let Some(logger) = &self.logger {
            logger.log(message);
        }
        self.unit.skip(message)
    }

    pub fn skipf(&self, args: fmt::Arguments<'_>) -> ! {
        if let Some(logger) = &self.logger {
            logger.logf(args);
        }
        self.unit.skip(&args.to_string())
    }

    pub fn failed(&self) -> bool {
        self.unit.failed()
    }

    pub fn skipped(&self) -> bool {
        self.unit.skipped()
    }
}

impl<U: Runner> Unit for W<U> {
    fn name(&self) -> &str {
        W::name(self)
    }

    fn cleanup(&self, f: Box<dyn FnOnce() + Send + 'static>) {
        self.unit.cleanup(f);
    }

    fn log(&self, message: &str) {
        W::log(self, message);
    }

    fn error(&self, message: &str) {
        W::error(self, message);
    }

    fn fatal(&self, message: &str) -> ! {
        W::fatal(self, message)
    }

    fn skip(&self, message: &str) -> ! {
        W::skip(self, message)
    }

    fn failed(&self) -> bool {
        W::failed(self)
    }

    fn skipped(&self) -> bool {
        W::skipped(self)
    }
}

impl<U: Runner> fmt::Debug for W<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("W")
            .field("name", &self.name())
            .field("ctx", &self.ctx)
            .field("middleware", &self.middleware.read().len())
            .field("logger", &self.logger.is_some())
            .finish()
    }
}
