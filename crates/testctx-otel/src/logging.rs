//! 把单元日志桥接到当前测试 Span 的中间件。

use std::{borrow::Cow, sync::Arc};

use opentelemetry::{Context as OtelContext, KeyValue, trace::TraceContextExt};
use testctx::{Context, Logger, Middleware, RunFn, Runner, W};

use crate::trace::current_span;

/// Span 事件中保存日志文本的属性键。
pub const MESSAGE_KEY: &str = "message";

/// 日志桥接配置。
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// `log`/`skip` 消息对应的 Span 事件名。
    pub log_event: Cow<'static, str>,
    /// `error`/`fatal` 消息对应的 Span 事件名。
    pub error_event: Cow<'static, str>,
    /// 是否同时以 `tracing` 事件输出。
    pub forward_to_tracing: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_event: Cow::Borrowed("log"),
            error_event: Cow::Borrowed("error"),
            forward_to_tracing: true,
        }
    }
}

/// 把镜像日志记录为 Span 事件的 [`Logger`]。
#[derive(Debug)]
pub struct SpanLogger {
    cx: OtelContext,
    config: LogConfig,
}

impl SpanLogger {
    pub fn new(cx: OtelContext, config: LogConfig) -> Self {
        Self { cx, config }
    }
}

impl Logger for SpanLogger {
    fn log(&self, message: &str) {
        self.cx.span().add_event(
            self.config.log_event.clone(),
            vec![KeyValue::new(MESSAGE_KEY, message.to_owned())],
        );
        if self.config.forward_to_tracing {
            tracing::info!(target: "testctx::otel", "{message}");
        }
    }

    fn error(&self, message: &str) {
        self.cx.span().add_event(
            self.config.error_event.clone(),
            vec![KeyValue::new(MESSAGE_KEY, message.to_owned())],
        );
        if self.config.forward_to_tracing {
            tracing::warn!(target: "testctx::otel", "{message}");
        }
    }
}

/// 为每个单元挂接 [`SpanLogger`] 的中间件。
///
/// Span 取自外层 [`with_tracing`](crate::with_tracing) 写入上下文的测试 Span，
/// 因此应放在追踪中间件之后；缺失时退回到线程当前的 OpenTelemetry 上下文。
pub fn with_logging<U: Runner>(config: LogConfig) -> Middleware<U> {
    Middleware::new(move |next: RunFn<U>| {
        let config = config.clone();
        RunFn::new(move |ctx: Context, w: W<U>| {
            let cx = current_span(&ctx)
                .map(|span| span.otel_context().clone())
                .unwrap_or_else(OtelContext::current);
            let logger: Arc<dyn Logger> = Arc::new(SpanLogger::new(cx, config.clone()));
            next.call(ctx, w.with_logger(logger));
        })
    })
}
