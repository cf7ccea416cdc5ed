//! # testctx-otel
//!
//! 把 `testctx` 单元树接入 OpenTelemetry：
//! - [`with_tracing`]：每个单元一个 Span，Span 树与测试树同构；
//! - [`with_logging`]：单元日志写入当前测试 Span 的事件；
//! - [`install`]：一次性注册全局 Provider 与 `tracing` Subscriber，并从 `TRACEPARENT`
//!   环境变量继承上游追踪上下文。

use std::{collections::HashMap, env, sync::OnceLock};

use opentelemetry::{
    Context as OtelContext, global,
    propagation::TextMapPropagator,
    trace::{TraceContextExt, TracerProvider as _},
};
use opentelemetry_sdk::{
    Resource,
    propagation::TraceContextPropagator,
    trace::{self as sdktrace, TracerProvider},
};
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

mod logging;
mod trace;

pub use logging::{LogConfig, MESSAGE_KEY, SpanLogger, with_logging};
pub use trace::{INSTRUMENTATION_NAME, TEST_NAME_KEY, TestSpan, TraceConfig, current_span, with_tracing};

#[cfg(feature = "test-util")]
use test_support::InMemorySpanExporter;

/// 安装状态的全局缓存，确保 `install` 仅执行一次。
static INSTALL_STATE: OnceLock<InstallState> = OnceLock::new();

/// 子单元没有外层测试 Span 时继承的上游上下文。
static PROPAGATED: OnceLock<OtelContext> = OnceLock::new();

/// testctx-otel 安装过程可能出现的错误。
///
/// # 教案式说明
/// - **意图（Why）**：归纳安装阶段的全部失败路径，便于测试入口统一处理。
/// - **契约（What）**：所有错误都实现 [`std::error::Error`]，保留底层错误信息。
#[derive(Debug)]
pub enum Error {
    /// `install` 被重复调用。
    AlreadyInstalled,
    /// 外部提前设置了全局 `tracing` Subscriber。
    SubscriberAlreadySet,
    /// 上游上下文已经登记过。
    ContextAlreadyPropagated,
    /// 设置全局 Subscriber 失败的底层错误。
    SetGlobalSubscriber(tracing::dispatcher::SetGlobalDefaultError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::AlreadyInstalled => f.write_str("testctx-otel 已完成安装，禁止重复调用 install"),
            Error::SubscriberAlreadySet => {
                f.write_str("全局 tracing Subscriber 已存在，testctx-otel 无法覆盖")
            }
            Error::ContextAlreadyPropagated => f.write_str("上游追踪上下文只能登记一次"),
            Error::SetGlobalSubscriber(err) => {
                write!(f, "设置 tracing 全局 Subscriber 失败: {err}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// 安装后的持久状态，保持 Provider 在进程生命周期内有效。
struct InstallState {
    provider: TracerProvider,
}

/// 登记根单元应继承的上游追踪上下文，仅第一次调用生效。
///
/// 只有携带有效 Span 的上下文才会被采用。
pub fn set_propagated_context(cx: OtelContext) -> Result<(), Error> {
    PROPAGATED.set(cx).map_err(|_| Error::ContextAlreadyPropagated)
}

pub(crate) fn propagated_context() -> Option<OtelContext> {
    PROPAGATED
        .get()
        .filter(|cx| cx.span().span_context().is_valid())
        .cloned()
}

/// 零配置安装入口：构建 Provider、注册 `tracing` 层并继承环境中的上游上下文。
///
/// # 教案式说明
/// - **逻辑（How）**：
///   1. 检查重复安装与外部已设置的 Subscriber；
///   2. 构建 `TracerProvider` 并注册到 `opentelemetry::global`，使未显式指定 Provider 的
///      [`with_tracing`] 自动使用它；
///   3. 组装 `EnvFilter + fmt + OpenTelemetry` Layer 并设为全局 Subscriber，过滤规则读取
///      `RUST_LOG`，缺省为 `info`；
///   4. 若环境变量 `TRACEPARENT` 存在，则把解析出的上下文登记为上游上下文。
/// - **契约（What）**：重复调用返回 [`Error::AlreadyInstalled`]；外部已配置 Subscriber 时返回
///   [`Error::SubscriberAlreadySet`]。
pub fn install() -> Result<(), Error> {
    if INSTALL_STATE.get().is_some() {
        return Err(Error::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(Error::SubscriberAlreadySet);
    }

    let state = install_impl()?;
    INSTALL_STATE
        .set(state)
        .map_err(|_| Error::AlreadyInstalled)
}

fn install_impl() -> Result<InstallState, Error> {
    let provider = build_tracer_provider();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.versioned_tracer(
        INSTRUMENTATION_NAME,
        Some(env!("CARGO_PKG_VERSION")),
        None::<&'static str>,
        None,
    );
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer));
    tracing::subscriber::set_global_default(subscriber).map_err(Error::SetGlobalSubscriber)?;

    if let Some(cx) = context_from_env() {
        if set_propagated_context(cx).is_err() {
            tracing::debug!(target: "testctx::otel", "upstream context already registered, TRACEPARENT ignored");
        }
    }

    Ok(InstallState { provider })
}

/// 刷新已安装的 Provider，通常在测试进程退出前调用。
pub fn flush() {
    if let Some(state) = INSTALL_STATE.get() {
        for result in state.provider.force_flush() {
            if let Err(err) = result {
                tracing::warn!(target: "testctx::otel", "span flush failed: {err}");
            }
        }
    }
}

fn context_from_env() -> Option<OtelContext> {
    let mut carrier = HashMap::new();
    for (key, var) in [("traceparent", "TRACEPARENT"), ("tracestate", "TRACESTATE")] {
        if let Ok(value) = env::var(var) {
            carrier.insert(key.to_owned(), value);
        }
    }
    if carrier.is_empty() {
        return None;
    }
    let cx = TraceContextPropagator::new().extract(&carrier);
    cx.span().span_context().is_valid().then_some(cx)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn build_tracer_provider() -> TracerProvider {
    #[allow(unused_mut)]
    let mut builder = TracerProvider::builder().with_config(
        sdktrace::config()
            .with_sampler(sdktrace::Sampler::AlwaysOn)
            .with_resource(Resource::default()),
    );

    #[cfg(feature = "test-util")]
    {
        builder = builder.with_simple_exporter(fetch_in_memory_exporter());
    }

    builder.build()
}

#[cfg(feature = "test-util")]
fn fetch_in_memory_exporter() -> InMemorySpanExporter {
    static EXPORTER: OnceLock<InMemorySpanExporter> = OnceLock::new();
    EXPORTER.get_or_init(InMemorySpanExporter::default).clone()
}

#[cfg(feature = "test-util")]
mod test_support {
    use std::sync::{Arc, Mutex};

    use futures_util::future::BoxFuture;
    use opentelemetry::trace::{TraceError, TraceResult};
    use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};

    /// 收集已完成 Span 供断言的导出器。
    ///
    /// # 教案式说明
    /// - **意图（Why）**：只保留“收集已完成 Span”这一测试能力，避免 `opentelemetry-sdk/testing`
    ///   间接启用额外运行时依赖。
    /// - **契约（What）**：`get_finished_spans` 返回缓冲快照；`reset` 清空缓冲；
    ///   `export` 追加一批 Span 后立即返回。
    #[derive(Clone, Debug, Default)]
    pub struct InMemorySpanExporter {
        spans: Arc<Mutex<Vec<SpanData>>>,
    }

    impl InMemorySpanExporter {
        pub fn get_finished_spans(&self) -> TraceResult<Vec<SpanData>> {
            self.spans
                .lock()
                .map(|guard| guard.iter().cloned().collect())
                .map_err(TraceError::from)
        }

        pub fn reset(&self) {
            if let Ok(mut guard) = self.spans.lock() {
                guard.clear();
            }
        }
    }

    impl SpanExporter for InMemorySpanExporter {
        fn export(&mut self, mut batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            let result = self
                .spans
                .lock()
                .map(|mut guard| guard.append(&mut batch))
                .map_err(TraceError::from);

            Box::pin(async move { result })
        }

        fn shutdown(&mut self) {
            self.reset();
        }
    }
}

#[cfg(feature = "test-util")]
/// 测试辅助工具：独立的内存导出 Provider 与全局安装后的导出 Span 访问。
pub mod testing {
    use super::*;

    pub use super::test_support::InMemorySpanExporter;
    pub use opentelemetry_sdk::export::trace::SpanData;

    /// 构造与全局状态无关、导出到内存的 Provider，适合并发运行的测试。
    pub fn in_memory_provider() -> (TracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_config(sdktrace::config().with_sampler(sdktrace::Sampler::AlwaysOn))
            .with_simple_exporter(exporter.clone())
            .build();
        (provider, exporter)
    }

    /// 强制刷新全局安装的 Provider。
    pub fn force_flush() {
        flush();
    }

    /// 获取自安装以来导出的全部 Span。
    pub fn finished_spans() -> Vec<SpanData> {
        fetch_in_memory_exporter()
            .get_finished_spans()
            .unwrap_or_default()
    }

    /// 清空全局内存导出器。
    pub fn reset() {
        fetch_in_memory_exporter().reset();
    }
}
