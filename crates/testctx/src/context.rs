use std::{
    any::{Any, TypeId},
    fmt,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// 上下文结束的原因。
///
/// # 教案式说明
/// - **意图（Why）**：测试体需要区分“被父级/清理流程主动取消”与“截止时间到期”，以便决定是
///   报告超时失败还是静默退出。
/// - **契约（What）**：取值一经写入即不可更改；子上下文因父级取消而结束时继承父级的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// 通过 [`CancelHandle::cancel`] 或单元结束时的清理回调主动取消。
    #[error("context canceled")]
    Canceled,
    /// 截止时间已过。
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// 取消作用域，统一表达父子上下文之间的可中断性契约。
///
/// # 设计背景（Why）
/// - 测试体可能阻塞在睡眠、I/O 或等待其他线程上，需要一个可被外部唤醒的取消信号；
/// - 子作用域必须在父作用域取消时同步取消，否则超时中间件无法约束嵌套子测试。
///
/// # 逻辑解析（How）
/// - `reason` 为一次性槽位，首次写入即视为取消，随后 `signal.notify_all` 唤醒所有等待者；
/// - `children` 以弱引用登记派生作用域，取消时级联；派生时若父级已取消则立即取消子级；
/// - 截止时间采用惰性检查：查询或等待时发现已过期，才会以 [`ContextError::DeadlineExceeded`] 落地。
///
/// # 契约说明（What）
/// - **锁顺序**：始终先取 `reason` 再取 `children`，派生与取消两条路径遵守同一顺序，避免漏级联；
/// - **后置条件**：一旦 `reason` 非空，该作用域及其全部后代的 `poll` 都返回非空。
struct Cancellation {
    reason: Mutex<Option<ContextError>>,
    signal: Condvar,
    deadline: Option<Instant>,
    children: Mutex<Vec<Weak<Cancellation>>>,
}

impl Cancellation {
    fn root() -> Arc<Self> {
        Arc::new(Self {
            reason: Mutex::new(None),
            signal: Condvar::new(),
            deadline: None,
            children: Mutex::new(Vec::new()),
        })
    }

    fn child(parent: &Arc<Self>, deadline: Option<Instant>) -> Arc<Self> {
        let deadline = match (parent.deadline, deadline) {
            (Some(inherited), Some(own)) => Some(inherited.min(own)),
            (inherited, own) => inherited.or(own),
        };
        let child = Arc::new(Self {
            reason: Mutex::new(None),
            signal: Condvar::new(),
            deadline,
            children: Mutex::new(Vec::new()),
        });

        parent.expire_if_due();
        let inherited = {
            let reason = parent.reason.lock();
            if reason.is_none() {
                let mut children = parent.children.lock();
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child));
            }
            *reason
        };
        if let Some(reason) = inherited {
            child.cancel(reason);
        }
        child
    }

    /// 写入取消原因并级联到后代；重复调用返回 `false`。
    fn cancel(&self, reason: ContextError) -> bool {
        let children = {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            self.signal.notify_all();
            std::mem::take(&mut *self.children.lock())
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
        true
    }

    fn expire_if_due(&self) {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.cancel(ContextError::DeadlineExceeded);
            }
        }
    }

    fn poll(&self) -> Option<ContextError> {
        self.expire_if_due();
        *self.reason.lock()
    }

    /// 等待取消或到达 `until`（若给出），返回结束原因；`until` 先到时返回 `None`。
    fn wait_until(&self, until: Option<Instant>) -> Option<ContextError> {
        loop {
            let mut reason = self.reason.lock();
            if let Some(reason) = *reason {
                return Some(reason);
            }

            let now = Instant::now();
            if self.deadline.is_some_and(|deadline| now >= deadline) {
                drop(reason);
                self.cancel(ContextError::DeadlineExceeded);
                continue;
            }
            if until.is_some_and(|until| now >= until) {
                return None;
            }

            let wake_at = match (self.deadline, until) {
                (Some(deadline), Some(until)) => Some(deadline.min(until)),
                (deadline, until) => deadline.or(until),
            };
            match wake_at {
                Some(at) => {
                    self.signal.wait_until(&mut reason, at);
                }
                None => self.signal.wait(&mut reason),
            }
        }
    }
}

/// 上下文链上的单个节点：可选的类型化绑定值、所属取消作用域与父节点。
struct Node {
    value: Option<(TypeId, Arc<dyn Any + Send + Sync>)>,
    scope: Arc<Cancellation>,
    parent: Option<Arc<Node>>,
}

/// 不可变、按因果顺序派生的传播值，携带取消信号与类型化键值绑定。
///
/// # 教案式说明
/// - **意图（Why）**：让每个测试/子测试都能拿到“从父级派生、在单元结束前必然取消”的上下文，
///   同时允许中间件为其包裹的子树注入数据（例如追踪 Span）。
/// - **逻辑（How）**：内部是一条 `(值, 取消作用域, 父节点)` 链表，克隆仅复制 `Arc`；
///   `with_*` 系列方法只追加新节点，从不修改已有节点，因此兄弟子树互相不可见。
/// - **契约（What）**：
///   - 值按 Rust 类型定位，最近的绑定优先；需要多个同类值时请使用新类型包装；
///   - 子作用域在父作用域取消时取消，截止时间取父子中较早者；
///   - 框架不会强行中断测试体，长时间运行的测试体应调用 [`Context::wait_timeout`] 或定期检查
///     [`Context::err`]。
#[derive(Clone)]
pub struct Context {
    inner: Arc<Node>,
}

impl Context {
    /// 返回永不取消、无绑定值的根上下文。
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Node {
                value: None,
                scope: Cancellation::root(),
                parent: None,
            }),
        }
    }

    /// 派生绑定了 `value` 的子上下文，取消语义与当前上下文完全相同。
    pub fn with_value<V>(&self, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        Self {
            inner: Arc::new(Node {
                value: Some((TypeId::of::<V>(), Arc::new(value))),
                scope: Arc::clone(&self.inner.scope),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    /// 沿链查找最近一次绑定的 `V`。
    pub fn value<V>(&self) -> Option<&V>
    where
        V: Any + Send + Sync,
    {
        let wanted = TypeId::of::<V>();
        let mut node = Some(&self.inner);
        while let Some(current) = node {
            if let Some((id, value)) = &current.value {
                if *id == wanted {
                    return value.downcast_ref::<V>();
                }
            }
            node = current.parent.as_ref();
        }
        None
    }

    /// 派生可独立取消的子上下文。
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        self.derive_scope(None)
    }

    /// 派生在 `deadline` 时刻到期的子上下文；若父级截止更早，以父级为准。
    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancelHandle) {
        self.derive_scope(Some(deadline))
    }

    /// 派生在 `timeout` 之后到期的子上下文。
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        self.derive_scope(Instant::now().checked_add(timeout))
    }

    fn derive_scope(&self, deadline: Option<Instant>) -> (Self, CancelHandle) {
        let scope = Cancellation::child(&self.inner.scope, deadline);
        let ctx = Self {
            inner: Arc::new(Node {
                value: None,
                scope: Arc::clone(&scope),
                parent: Some(Arc::clone(&self.inner)),
            }),
        };
        (ctx, CancelHandle { scope })
    }

    /// 生效的截止时间（自身与祖先中最早者）。
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.scope.deadline
    }

    /// 若上下文已结束，返回结束原因。
    pub fn err(&self) -> Option<ContextError> {
        self.inner.scope.poll()
    }

    /// 上下文是否已结束。
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// 阻塞直至上下文结束。对 [`Context::background`] 调用将永久阻塞。
    pub fn wait(&self) -> ContextError {
        loop {
            if let Some(reason) = self.inner.scope.wait_until(None) {
                return reason;
            }
        }
    }

    /// 最多等待 `timeout`：期间上下文结束则返回原因，否则返回 `None`。
    ///
    /// 等价于在“上下文结束”与“计时器到期”之间二选一，是测试体响应取消的推荐写法：
    ///
    /// ```
    /// # use std::time::Duration;
    /// # use testctx::Context;
    /// let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(10));
    /// assert!(ctx.wait_timeout(Duration::from_secs(5)).is_some());
    /// ```
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ContextError> {
        let until = Instant::now().checked_add(timeout);
        self.inner.scope.wait_until(until)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline())
            .field("err", &self.err())
            .finish_non_exhaustive()
    }
}

/// 取消句柄，与 [`Context::with_cancel`] 等派生方法成对返回。
///
/// `cancel` 幂等：首次取消返回 `true`，之后返回 `false`。丢弃句柄不会取消上下文，
/// 需要“所有退出路径都取消”时使用 [`CancelHandle::guard`]。
#[derive(Clone)]
pub struct CancelHandle {
    scope: Arc<Cancellation>,
}

impl CancelHandle {
    /// 取消对应上下文及其全部后代。
    pub fn cancel(&self) -> bool {
        self.scope.cancel(ContextError::Canceled)
    }

    /// 转换为在析构时取消的守卫，覆盖正常返回与栈展开两种退出路径。
    pub fn guard(self) -> CancelGuard {
        CancelGuard { handle: self }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.scope.reason.lock().is_some())
            .finish()
    }
}

/// 析构时取消上下文的守卫。
#[derive(Debug)]
pub struct CancelGuard {
    handle: CancelHandle,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct Depth(usize);

    #[test]
    fn values_resolve_to_nearest_binding_and_stay_in_their_subtree() {
        let root = Context::background().with_value(Depth(1));
        let left = root.with_value(Depth(2));
        let right = root.with_cancel().0;

        assert_eq!(left.value::<Depth>(), Some(&Depth(2)));
        assert_eq!(right.value::<Depth>(), Some(&Depth(1)));
        assert_eq!(root.value::<Depth>(), Some(&Depth(1)));
        assert_eq!(Context::background().value::<Depth>(), None);
    }

    #[test]
    fn cancellation_is_idempotent_and_cascades_to_children() {
        let (parent, cancel) = Context::background().with_cancel();
        let (child, _child_cancel) = parent.with_cancel();
        let grandchild = child.with_value(Depth(3));

        assert!(!grandchild.is_done());
        assert!(cancel.cancel(), "首次取消应返回 true");
        assert!(!cancel.cancel(), "重复取消必须保持幂等");
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(grandchild.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let (parent, _cancel) = Context::background().with_cancel();
        let (child, child_cancel) = parent.with_cancel();
        child_cancel.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[test]
    fn deriving_from_cancelled_parent_is_immediately_cancelled() {
        let (parent, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let (child, _) = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn deadline_is_inherited_and_observed_lazily() {
        let (parent, _cancel) = Context::background().with_timeout(Duration::from_millis(20));
        let (child, _) = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        assert_eq!(
            child.wait_timeout(Duration::from_secs(5)),
            Some(ContextError::DeadlineExceeded)
        );
        assert_eq!(parent.err(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn wait_timeout_returns_none_when_context_outlives_timer() {
        let (ctx, _cancel) = Context::background().with_cancel();
        assert_eq!(ctx.wait_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn cancel_wakes_waiter_on_another_thread() {
        let (ctx, cancel) = Context::background().with_cancel();
        let waiter = thread::spawn(move || ctx.wait());
        thread::sleep(Duration::from_millis(10));
        cancel.cancel();
        assert_eq!(waiter.join().unwrap(), ContextError::Canceled);
    }

    #[test]
    fn guard_cancels_on_unwind() {
        let (ctx, cancel) = Context::background().with_cancel();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cancel.guard();
            panic!("boom");
        }));
        assert!(outcome.is_err());
        assert!(ctx.is_done());
    }
}
