use std::env;

/// 读取基准迭代次数的环境变量。
pub const BENCH_ITERATIONS_ENV: &str = "TESTCTX_BENCH_N";

/// 打开逐单元输出的环境变量（`1`/`true`）。
pub const VERBOSE_ENV: &str = "TESTCTX_VERBOSE";

/// 宿主运行参数。
///
/// - `bench_iterations`：基准单元的 `n()`，默认 `1`；
/// - `verbose`：为 `true` 时每个单元结束都输出其日志，否则仅在失败时输出。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostOptions {
    pub bench_iterations: u64,
    pub verbose: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            bench_iterations: 1,
            verbose: false,
        }
    }
}

impl HostOptions {
    /// 以默认值为基础读取环境变量；无法解析的值被忽略。
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(n) = lookup(BENCH_ITERATIONS_ENV).and_then(|raw| raw.trim().parse::<u64>().ok()) {
            if n > 0 {
                options.bench_iterations = n;
            } else {
                tracing::warn!(target: "testctx::host", "ignoring {BENCH_ITERATIONS_ENV}=0");
            }
        }
        if let Some(raw) = lookup(VERBOSE_ENV) {
            options.verbose = matches!(raw.trim(), "1" | "true" | "TRUE" | "yes");
        }
        options
    }

    pub fn with_bench_iterations(mut self, n: u64) -> Self {
        self.bench_iterations = n.max(1);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}
