use std::{fmt, sync::Arc, time::Duration};

use crate::{
    context::Context,
    contract::{ParallelUnit, Runner},
    logger::Logger,
    wrapper::W,
};

/// 测试体：接收上下文与包装器。
///
/// 以 `Arc` 持有闭包，因此同一个测试体可被多次调用（中间件可重试、可按需调用零次）。
pub struct RunFn<U: Runner>(Arc<dyn Fn(Context, W<U>) + Send + Sync>);

impl<U: Runner> RunFn<U> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Context, W<U>) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, ctx: Context, w: W<U>) {
        (self.0)(ctx, w)
    }
}

impl<U: Runner> Clone for RunFn<U> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<U: Runner> fmt::Debug for RunFn<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunFn").finish_non_exhaustive()
    }
}

/// 中间件：把一个测试体变换为另一个测试体。
///
/// # 教案式说明
/// - **意图（Why）**：超时、并行、追踪、日志镜像等横切关注点都表达为“包裹下一个测试体”的函数，
///   从而可以自由组合，并沿子测试树自动继承。
/// - **逻辑（How）**：包装器在每次 `run` 时对其中间件列表调用 [`compose`]，因此中间件工厂
///   对每个子单元都会被重新调用一次，可以在其中安全地持有逐单元状态。
/// - **契约（What）**：
///   - 列表中的第 0 个中间件位于最外层，最先观察到调用；
///   - 中间件可以替换传给下一层的上下文与包装器，也可以选择不调用下一层；
///   - 中间件运行在子单元自己的线程上，因此可以调用 `fatal`/`skip`。
pub struct Middleware<U: Runner>(Arc<dyn Fn(RunFn<U>) -> RunFn<U> + Send + Sync>);

impl<U: Runner> Middleware<U> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(RunFn<U>) -> RunFn<U> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// 用当前中间件包裹 `next`。
    pub fn wrap(&self, next: RunFn<U>) -> RunFn<U> {
        (self.0)(next)
    }
}

impl<U: Runner> Clone for Middleware<U> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<U: Runner> fmt::Debug for Middleware<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware").finish_non_exhaustive()
    }
}

/// 按逆序折叠中间件，使 `middleware[0]` 成为最外层。
pub fn compose<U: Runner>(middleware: &[Middleware<U>], terminal: RunFn<U>) -> RunFn<U> {
    middleware
        .iter()
        .rev()
        .fold(terminal, |next, layer| layer.wrap(next))
}

/// 为下游派生带截止时间的上下文；下游返回（或展开）时释放该上下文。
///
/// 截止时间只通过上下文传达，不会强行中断测试体。
pub fn timeout<U: Runner>(duration: Duration) -> Middleware<U> {
    Middleware::new(move |next: RunFn<U>| {
        RunFn::new(move |ctx: Context, w: W<U>| {
            let (ctx, cancel) = ctx.with_timeout(duration);
            let _release = cancel.guard();
            next.call(ctx, w);
        })
    })
}

/// 在调用下游之前把单元切换到并行模式。
pub fn parallel<U: ParallelUnit>() -> Middleware<U> {
    Middleware::new(|next: RunFn<U>| {
        RunFn::new(move |ctx: Context, w: W<U>| {
            w.unit().parallel();
            next.call(ctx, w);
        })
    })
}

/// 在调用下游之前以 `(上下文, 完整单元名)` 调用观察回调。
pub fn instrumentation<U, F>(callback: F) -> Middleware<U>
where
    U: Runner,
    F: Fn(&Context, &str) + Send + Sync + 'static,
{
    let callback = Arc::new(callback);
    Middleware::new(move |next: RunFn<U>| {
        let callback = Arc::clone(&callback);
        RunFn::new(move |ctx: Context, w: W<U>| {
            callback(&ctx, w.name());
            next.call(ctx, w);
        })
    })
}

/// 为下游包装器挂接日志镜像接收端。
pub fn log_to<U: Runner>(sink: Arc<dyn Logger>) -> Middleware<U> {
    Middleware::new(move |next: RunFn<U>| {
        let sink = Arc::clone(&sink);
        RunFn::new(move |ctx: Context, w: W<U>| {
            next.call(ctx, w.with_logger(Arc::clone(&sink)));
        })
    })
}
