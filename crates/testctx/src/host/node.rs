use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
    time::Instant,
};

use parking_lot::Mutex;

use super::{
    options::HostOptions,
    report::{Outcome, Report},
};

/// `fatal` 用于终止测试体的展开载荷。
struct FailNow;

/// `skip` 用于终止测试体的展开载荷。
struct SkipNow;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// 子单元线程发往父单元的事件。
enum Event {
    Paused,
    Finished(Report),
}

/// 子单元与父单元之间的并行握手通道，只能使用一次。
struct Handshake {
    events: mpsc::Sender<Event>,
    release: mpsc::Receiver<()>,
}

/// 已暂停、等待父单元主体结束后放行的并行子单元。
struct PendingChild {
    release: mpsc::Sender<()>,
    events: mpsc::Receiver<Event>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct NodeState {
    failed: bool,
    skipped: bool,
    output: Vec<String>,
    cleanups: Vec<Cleanup>,
    children: Vec<Report>,
    sub_names: HashMap<String, usize>,
    pending: Vec<PendingChild>,
}

/// 宿主中的一个运行单元。
///
/// # 教案式说明
/// - **意图（Why）**：提供与常见测试宿主一致的语义：子单元同步运行、`fatal`/`skip` 立即终止、
///   清理回调后进先出、并行子单元在父单元主体结束后并发完成。
/// - **逻辑（How）**：
///   1. 每个单元运行在独立命名线程上，测试体包在 `catch_unwind` 中；
///      `fatal`/`skip` 以私有载荷展开，其他 panic 视为失败并记录消息；
///   2. 父单元在 `spawn` 中阻塞于事件通道，直到收到 `Finished` 或 `Paused`；
///   3. 主体结束后依次放行并等待全部并行子单元，随后按 LIFO 执行清理，最后生成报告。
/// - **契约（What）**：失败会沿父链向上传播；子单元的清理总是先于父单元的清理执行。
pub(super) struct Node {
    name: String,
    parent: Option<Arc<Node>>,
    pub(super) options: Arc<HostOptions>,
    state: Mutex<NodeState>,
    handshake: Mutex<Option<Handshake>>,
}

impl Node {
    fn new(name: String, parent: Option<Arc<Node>>, options: Arc<HostOptions>, handshake: Option<Handshake>) -> Self {
        Self {
            name,
            parent,
            options,
            state: Mutex::new(NodeState::default()),
            handshake: Mutex::new(handshake),
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn log(&self, message: &str) {
        tracing::trace!(target: "testctx::host", unit = %self.name, "{message}");
        self.state.lock().output.push(message.to_owned());
    }

    pub(super) fn error(&self, message: &str) {
        self.log(message);
        self.fail();
    }

    pub(super) fn fatal(&self, message: &str) -> ! {
        self.error(message);
        panic::resume_unwind(Box::new(FailNow))
    }

    pub(super) fn skip(&self, message: &str) -> ! {
        self.log(message);
        self.state.lock().skipped = true;
        panic::resume_unwind(Box::new(SkipNow))
    }

    fn fail(&self) {
        let mut node = Some(self);
        while let Some(current) = node {
            current.state.lock().failed = true;
            node = current.parent.as_deref();
        }
    }

    pub(super) fn failed(&self) -> bool {
        self.state.lock().failed
    }

    pub(super) fn skipped(&self) -> bool {
        self.state.lock().skipped
    }

    pub(super) fn cleanup(&self, f: Cleanup) {
        self.state.lock().cleanups.push(f);
    }

    /// 暂停当前线程，等父单元主体结束后放行；根单元或重复调用时无操作。
    pub(super) fn pause_for_parallel(&self) {
        let Some(handshake) = self.handshake.lock().take() else {
            return;
        };
        if handshake.events.send(Event::Paused).is_err() {
            return;
        }
        tracing::debug!(target: "testctx::host", unit = %self.name, "paused for parallel run");
        // 父单元放行或已提前退出，两种情况都继续执行。
        let _ = handshake.release.recv();
    }

    /// 规范化子单元名：空白替换为 `_`，已被占用的名字追加 `#01`、`#02` 等后缀，直到不再冲突。
    ///
    /// 后缀生成的名字同样登记为已占用，因此显式请求 `a#01` 之后再请求 `a` 会得到 `a#01#01`。
    fn child_name(&self, requested: &str) -> String {
        let mut unique: String = requested
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        let mut empty = unique.is_empty();
        let mut state = self.state.lock();
        loop {
            let issued = state.sub_names.get(&unique).copied();
            if !empty && issued.is_none() {
                state.sub_names.insert(unique.clone(), 1);
                break;
            }
            let next = issued.unwrap_or(0);
            state.sub_names.insert(unique.clone(), next + 1);
            unique = format!("{unique}#{next:02}");
            empty = false;
        }
        format!("{}/{}", self.name, unique)
    }

    /// 在新线程上运行子单元，阻塞到其结束或进入并行暂停。
    pub(super) fn spawn<F>(self: &Arc<Self>, requested: &str, body: F) -> bool
    where
        F: FnOnce(Arc<Node>) + Send + 'static,
    {
        let name = self.child_name(requested);
        let (events_tx, events_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let child = Arc::new(Node::new(
            name.clone(),
            Some(Arc::clone(self)),
            Arc::clone(&self.options),
            Some(Handshake {
                events: events_tx.clone(),
                release: release_rx,
            }),
        ));

        let runner = Arc::clone(&child);
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let report = runner.execute(body);
            let _ = events_tx.send(Event::Finished(report));
        });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                self.error(&format!("failed to start unit {name}: {err}"));
                return false;
            }
        };

        match events_rx.recv() {
            Ok(Event::Finished(report)) => {
                let _ = thread.join();
                let passed = !report.failed();
                self.state.lock().children.push(report);
                passed
            }
            Ok(Event::Paused) => {
                self.state.lock().pending.push(PendingChild {
                    release: release_tx,
                    events: events_rx,
                    thread,
                });
                !child.failed()
            }
            Err(_) => {
                let _ = thread.join();
                self.error(&format!("unit {name} exited without reporting"));
                false
            }
        }
    }

    /// 运行测试体及其收尾流程，返回报告。必须在单元自己的线程上调用。
    pub(super) fn execute<F>(self: &Arc<Self>, body: F) -> Report
    where
        F: FnOnce(Arc<Node>),
    {
        let started = Instant::now();
        let span = tracing::debug_span!(target: "testctx::host", "unit", name = %self.name);
        let _entered = span.enter();
        tracing::debug!(target: "testctx::host", "unit started");

        let node = Arc::clone(self);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || body(node))) {
            self.absorb_panic(payload);
        }
        self.handshake.lock().take();
        self.release_parallel();
        self.run_cleanups();

        let report = self.report(started);
        if self.options.verbose || report.failed() {
            for line in report.output() {
                tracing::info!(target: "testctx::host", "{line}");
            }
        }
        tracing::debug!(
            target: "testctx::host",
            outcome = ?report.outcome(),
            elapsed_ms = report.elapsed().as_millis() as u64,
            "unit finished"
        );
        report
    }

    fn absorb_panic(&self, payload: Box<dyn Any + Send>) {
        if payload.is::<FailNow>() || payload.is::<SkipNow>() {
            return;
        }
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        self.error(&format!("panic: {message}"));
    }

    fn release_parallel(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending);
        for child in &pending {
            let _ = child.release.send(());
        }
        for child in pending {
            match child.events.recv() {
                Ok(Event::Finished(report)) => {
                    self.state.lock().children.push(report);
                }
                Ok(Event::Paused) | Err(_) => {
                    self.error("parallel unit exited without reporting");
                }
            }
            let _ = child.thread.join();
        }
    }

    fn run_cleanups(&self) {
        loop {
            let next = self.state.lock().cleanups.pop();
            let Some(cleanup) = next else {
                break;
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cleanup)) {
                self.absorb_panic(payload);
            }
        }
    }

    fn report(&self, started: Instant) -> Report {
        let mut state = self.state.lock();
        let outcome = if state.failed {
            Outcome::Failed
        } else if state.skipped {
            Outcome::Skipped
        } else {
            Outcome::Passed
        };
        Report {
            name: self.name.clone(),
            outcome,
            output: state.output.clone(),
            children: std::mem::take(&mut state.children),
            elapsed: started.elapsed(),
        }
    }
}

/// 在新线程上以 `name` 运行根单元。
pub(super) fn execute_root<F>(name: &str, options: HostOptions, body: F) -> Report
where
    F: FnOnce(Arc<Node>) + Send + 'static,
{
    let root = Arc::new(Node::new(name.to_owned(), None, Arc::new(options), None));
    let spawned = thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || root.execute(body));
    match spawned {
        Ok(thread) => thread
            .join()
            .unwrap_or_else(|_| Report::aborted(name, "unit thread panicked outside its body".to_owned())),
        Err(err) => Report::aborted(name, format!("failed to start unit thread: {err}")),
    }
}
