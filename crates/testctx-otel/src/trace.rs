//! 测试单元级别的 OpenTelemetry Span 中间件。

use std::{fmt, sync::Arc, thread};

use opentelemetry::{
    Context as OtelContext, KeyValue, global,
    trace::{Link, SpanBuilder, SpanContext, Status, TraceContextExt, Tracer as _, TracerProvider as _},
};
use opentelemetry_sdk::trace::{Tracer as SdkTracer, TracerProvider};
use testctx::{Context, Middleware, RunFn, Runner, W};

use crate::propagated_context;

/// 创建 Tracer 时使用的 instrumentation 名称。
pub const INSTRUMENTATION_NAME: &str = "testctx";

/// 记录完整单元名的 Span 属性键（Span 名本身只取最后一段）。
pub const TEST_NAME_KEY: &str = "test.name";

type StartOptions<U> = Arc<dyn Fn(&W<U>) -> Vec<KeyValue> + Send + Sync>;

/// 追踪中间件配置。
///
/// - `tracer_provider`：为空时使用全局 Provider；
/// - `attributes`：附加到每个单元 Span 的静态属性；
/// - `start_options`：按单元计算的额外属性，在 Span 创建前调用。
pub struct TraceConfig<U: Runner> {
    pub tracer_provider: Option<TracerProvider>,
    pub attributes: Vec<KeyValue>,
    pub start_options: Option<StartOptions<U>>,
}

impl<U: Runner> TraceConfig<U> {
    pub fn with_tracer_provider(mut self, provider: TracerProvider) -> Self {
        self.tracer_provider = Some(provider);
        self
    }

    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn with_start_options<F>(mut self, f: F) -> Self
    where
        F: Fn(&W<U>) -> Vec<KeyValue> + Send + Sync + 'static,
    {
        self.start_options = Some(Arc::new(f));
        self
    }
}

impl<U: Runner> Default for TraceConfig<U> {
    fn default() -> Self {
        Self {
            tracer_provider: None,
            attributes: Vec::new(),
            start_options: None,
        }
    }
}

impl<U: Runner> Clone for TraceConfig<U> {
    fn clone(&self) -> Self {
        Self {
            tracer_provider: self.tracer_provider.clone(),
            attributes: self.attributes.clone(),
            start_options: self.start_options.clone(),
        }
    }
}

impl<U: Runner> fmt::Debug for TraceConfig<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceConfig")
            .field("tracer_provider", &self.tracer_provider.is_some())
            .field("attributes", &self.attributes)
            .field("start_options", &self.start_options.is_some())
            .finish()
    }
}

/// 绑定在 [`Context`] 中的当前测试 Span，供子单元建立父子关系与链接。
#[derive(Clone, Debug)]
pub struct TestSpan {
    cx: OtelContext,
}

impl TestSpan {
    /// 携带该 Span 的 OpenTelemetry 上下文。
    pub fn otel_context(&self) -> &OtelContext {
        &self.cx
    }

    pub fn span_context(&self) -> SpanContext {
        self.cx.span().span_context().clone()
    }
}

/// 读取由外层追踪中间件写入的测试 Span。
pub fn current_span(ctx: &Context) -> Option<&TestSpan> {
    ctx.value::<TestSpan>()
}

#[derive(Clone)]
enum TestTracer {
    Sdk(SdkTracer),
    Global(Arc<global::BoxedTracer>),
}

impl TestTracer {
    fn new(provider: Option<&TracerProvider>) -> Self {
        let version = Some(env!("CARGO_PKG_VERSION"));
        match provider {
            Some(provider) => Self::Sdk(provider.versioned_tracer(
                INSTRUMENTATION_NAME,
                version,
                None::<&'static str>,
                None,
            )),
            None => Self::Global(Arc::new(global::tracer_provider().versioned_tracer(
                INSTRUMENTATION_NAME,
                version,
                None::<&'static str>,
                None,
            ))),
        }
    }

    /// 以 `parent` 为父上下文启动 Span，返回携带新 Span 的上下文。
    fn start(&self, builder: SpanBuilder, parent: &OtelContext) -> OtelContext {
        match self {
            Self::Sdk(tracer) => parent.with_span(tracer.build_with_context(builder, parent)),
            Self::Global(tracer) => parent.with_span(tracer.build_with_context(builder, parent)),
        }
    }
}

/// 单元退出（含展开）时写入状态并结束 Span。
struct SpanGuard<U: Runner> {
    cx: OtelContext,
    unit: W<U>,
}

impl<U: Runner> Drop for SpanGuard<U> {
    fn drop(&mut self) {
        // 普通 panic 在宿主捕获之前尚未标记失败；skip 的展开已提前标记跳过。
        let failed = self.unit.failed() || (thread::panicking() && !self.unit.skipped());
        let span = self.cx.span();
        if failed {
            span.set_status(Status::error("test failed"));
        } else {
            span.set_status(Status::Ok);
        }
        span.end();
    }
}

/// 为每个单元创建一个 Span 的中间件。
///
/// # 教案式说明
/// - **意图（Why）**：让测试树在追踪后端呈现为 Span 树，并行子测试也能通过链接归属到父测试。
/// - **逻辑（How）**：
///   1. 父上下文优先取外层中间件写入的 [`TestSpan`]，其次取
///      [`set_propagated_context`](crate::set_propagated_context) 登记的上下文，否则新建根 Span；
///   2. Span 名为 [`W::base_name`]，完整名写入 [`TEST_NAME_KEY`] 属性，存在外层 Span 时追加链接；
///   3. 新 Span 写入 [`Context`] 后调用下游，守卫在所有退出路径上写状态并结束 Span。
/// - **契约（What）**：单元失败时状态为 `Error("test failed")`，否则为 `Ok`。
pub fn with_tracing<U: Runner>(config: TraceConfig<U>) -> Middleware<U> {
    let tracer = TestTracer::new(config.tracer_provider.as_ref());
    let attributes = Arc::new(config.attributes);
    let start_options = config.start_options;

    Middleware::new(move |next: RunFn<U>| {
        let tracer = tracer.clone();
        let attributes = Arc::clone(&attributes);
        let start_options = start_options.clone();
        RunFn::new(move |ctx: Context, w: W<U>| {
            let enclosing = current_span(&ctx).map(|span| span.cx.clone());
            let parent = enclosing
                .clone()
                .or_else(propagated_context)
                .unwrap_or_else(OtelContext::new);

            let mut span_attributes = attributes.as_ref().clone();
            span_attributes.push(KeyValue::new(TEST_NAME_KEY, w.name().to_owned()));
            if let Some(extra) = &start_options {
                span_attributes.extend(extra(&w));
            }

            let mut builder =
                SpanBuilder::from_name(w.base_name().to_owned()).with_attributes(span_attributes);
            if let Some(enclosing) = &enclosing {
                builder = builder.with_links(vec![Link::new(
                    enclosing.span().span_context().clone(),
                    Vec::new(),
                )]);
            }

            let cx = tracer.start(builder, &parent);
            let _guard = SpanGuard {
                cx: cx.clone(),
                unit: w.clone(),
            };
            next.call(ctx.with_value(TestSpan { cx }), w);
        })
    })
}
