/// 测试运行单元的最小能力集：命名、清理、记录与失败控制。
///
/// # 教案式说明
/// - **意图（Why）**：包装器与中间件只依赖这组能力，因此可以同时服务单元测试与基准测试，
///   也可以挂接到任何能提供这些能力的宿主上。
/// - **契约（What）**：
///   - `name` 返回以 `/` 分隔的完整层级名；
///   - `cleanup` 注册的回调在单元结束（含全部子单元结束）后按后进先出顺序执行；
///   - `error` 记录消息并标记失败，但测试体继续执行；
///   - `fatal` / `skip` 记录消息后立即终止当前测试体，不会返回；
///     它们必须在运行该测试体的线程上调用。
pub trait Unit: Send + Sync {
    /// 完整层级名，例如 `Root/sub/leaf`。
    fn name(&self) -> &str;

    /// 注册在单元结束后执行的清理回调。
    fn cleanup(&self, f: Box<dyn FnOnce() + Send + 'static>);

    /// 记录一条普通日志。
    fn log(&self, message: &str);

    /// 记录错误并将单元标记为失败。
    fn error(&self, message: &str);

    /// 记录错误、标记失败并立即终止测试体。
    fn fatal(&self, message: &str) -> !;

    /// 记录原因、标记跳过并立即终止测试体。
    fn skip(&self, message: &str) -> !;

    /// 单元（或其任一子单元）是否已失败。
    fn failed(&self) -> bool;

    /// 单元是否已被跳过。
    fn skipped(&self) -> bool;
}

/// 能够派生具名子单元的运行单元。
///
/// `run` 同步执行 `body`：普通子单元结束后才返回；若子单元进入并行模式，
/// 则在其暂停时返回，子单元稍后与兄弟单元并发完成。返回值表示子单元在返回时刻是否未失败。
pub trait Runner: Unit + Clone + Sized + 'static {
    /// 以 `name` 派生子单元并在其中运行 `body`。
    fn run<F>(&self, name: &str, body: F) -> bool
    where
        F: FnOnce(Self) + Send + 'static;
}

/// 支持与兄弟单元并行执行的运行单元（基准测试不支持）。
pub trait ParallelUnit: Runner {
    /// 暂停当前单元，待父单元主体结束后与其他并行兄弟一起继续。
    fn parallel(&self);
}
