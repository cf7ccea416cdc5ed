use std::{fmt, sync::Arc};

use parking_lot::Mutex;

/// 可选的日志镜像接收端。
///
/// 包装器在委托给运行单元之后（`fatal`/`skip` 则在委托之前）把消息镜像到这里：
/// `log`/`skip` 对应 [`Logger::log`]，`error`/`fatal` 对应 [`Logger::error`]。
/// 格式化变体默认落到未格式化方法上，实现者只在需要保留参数结构时覆盖它们。
pub trait Logger: Send + Sync {
    fn log(&self, message: &str);

    fn error(&self, message: &str);

    fn logf(&self, args: fmt::Arguments<'_>) {
        self.log(&args.to_string());
    }

    fn errorf(&self, args: fmt::Arguments<'_>) {
        self.error(&args.to_string());
    }
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn log(&self, message: &str) {
        (**self).log(message);
    }

    fn error(&self, message: &str) {
        (**self).error(message);
    }

    fn logf(&self, args: fmt::Arguments<'_>) {
        (**self).logf(args);
    }

    fn errorf(&self, args: fmt::Arguments<'_>) {
        (**self).errorf(args);
    }
}

/// 将镜像日志转为 `tracing` 事件：`log` 记为 INFO，`error` 记为 WARN。
///
/// 宿主为每个单元进入一个名为 `unit` 的 Span，因此事件会自动携带单元名。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, message: &str) {
        tracing::info!(target: "testctx", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::warn!(target: "testctx", "{message}");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// 把镜像日志按顺序收集到内存，便于断言。
#[derive(Debug, Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前已记录条目的快照。
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// 仅返回消息文本，便于与字面量比较。
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    fn push(&self, level: LogLevel, message: &str) {
        self.entries.lock().push(LogEntry {
            level,
            message: message.to_owned(),
        });
    }
}

impl Logger for RecordingLogger {
    fn log(&self, message: &str) {
        self.push(LogLevel::Log, message);
    }

    fn error(&self, message: &str) {
        self.push(LogLevel::Error, message);
    }
}
