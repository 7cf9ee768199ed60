use std::{
    fmt,
    pin::pin,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

/// 取消原语，统一表达跨任务的可中断性契约。
///
/// ## 为什么需要（Why）
/// - 传输层的每个挂起点（读、写、建连、接受、出站排队）都必须能被外部主动打断，
///   否则一条卡死的连接会拖住关闭流程；
/// - 取消令牌以值的形式显式传入每个操作，不存在全局注册表。
///
/// ## 如何实现（How）
/// - 内部使用 [`AtomicBool`] 表达取消状态，并配合 [`Notify`] 立即唤醒等待方；
/// - `cancel` 在首次成功设置取消位时返回 `true`，重复调用返回 `false`；
/// - `child` 派生独立的子令牌：父令牌取消时子令牌随之取消，反之不然。
///
/// ## 对外保证（What）
/// - **前置条件**：构造时默认处于“未取消”状态；
/// - **后置条件**：`cancel` 成功后 [`Cancellation::cancelled`] 的所有等待者都会被唤醒。
///
/// ## 代价（Trade-offs）
/// - 父子关系以 `Weak` 记录，子令牌被释放后父令牌只在下一次派生时清理失效条目。
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<CancellationState>>>,
}

impl CancellationState {
    fn cancel(&self) -> bool {
        if self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.notify.notify_waiters();
        let children = match self.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
        true
    }
}

impl Cancellation {
    /// 新建尚未触发的令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState::default()),
        }
    }

    /// 是否已触发。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 触发取消并唤醒所有等待者，连同全部子令牌。
    ///
    /// 只有真正完成状态翻转的那次调用返回 `true`。
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// 派生子令牌，父令牌取消时子令牌一并取消。
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut children = match self.inner.children.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // 注册与取消之间可能交错，注册后再检查一次父状态。
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// 等待取消发生；已取消时立即返回。
    pub async fn cancelled(&self) {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// 截止原语，描述操作的最迟完成时间。
///
/// 基于 Tokio 单调时钟，测试中暂停时间后依然可预测。未设置时代表不施加硬超时。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 不设截止。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 以 Tokio 时间点作为截止。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以当前时刻加持续时间生成截止时间。
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 截止时间是否已过。
    pub fn is_expired(&self) -> bool {
        self.instant.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// 剩余时长；未设截止时为 `None`，已过期时为零。
    pub fn remaining(&self) -> Option<Duration> {
        self.instant
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// 调用上下文，在传输组件之间按值传递取消/截止二元组。
///
/// ## 组成（What）
/// - `Cancellation`：通过 [`CallContext::cancellation`] 获取，任何挂起点都会观察它；
/// - `Deadline`：通过 [`CallContext::deadline`] 查询；稳态读写通常不设截止，只在建连与握手阶段设置。
///
/// ## 注意（Trade-offs）
/// - 克隆成本为一次 `Arc` 计数递增；超时不会自动触发取消，由包装器在竞速时分别报告。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    /// 获取取消原语。
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// 查询截止时间。
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deadline = match self.deadline.remaining() {
            Some(remaining) => format!("{remaining:?}"),
            None => "none".to_string(),
        };
        write!(
            f,
            "CallContext{{cancelled={}, deadline={}}}",
            self.cancellation.is_cancelled(),
            deadline
        )
    }
}

/// `CallContext` 构建器。
#[derive(Default)]
pub struct CallContextBuilder {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContextBuilder {
    /// 设置取消原语。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 设置截止时间。
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// 以相对时长设置截止时间。
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Deadline::after(timeout))
    }

    pub fn build(self) -> CallContext {
        CallContext {
            cancellation: self.cancellation,
            deadline: self.deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reports_first_transition_only() {
        let token = Cancellation::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn parent_cancellation_reaches_children_but_not_back() {
        let parent = Cancellation::new();
        let first = parent.child();
        let second = parent.child();
        assert!(second.cancel());
        assert!(!parent.is_cancelled());
        assert!(!first.is_cancelled());

        parent.cancel();
        assert!(first.is_cancelled());

        let late = parent.child();
        assert!(late.is_cancelled(), "已取消父令牌派生的子令牌应立即处于取消状态");
    }

    #[tokio::test]
    async fn waiters_wake_on_cancel() {
        let token = Cancellation::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("等待者应被唤醒")
            .expect("等待任务不应 panic");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_tokio_clock() {
        let deadline = Deadline::after(Duration::from_millis(100));
        assert!(!deadline.is_expired());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
        assert!(!Deadline::none().is_expired());
    }
}
