use crate::{
    channel::TcpChannel,
    codec::Frame,
    context::CallContext,
    error::{Result, TransportError},
    pump::{self, PumpLifecycle},
    settings::Settings,
};
use bytes::Bytes;
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;

/// 进程内唯一的关联编号，用于日志关联与注册表索引。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssociationId(u64);

impl AssociationId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assoc-{}", self.0)
    }
}

/// 关联由哪一侧发起。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 由监听器接受。
    Inbound,
    /// 由本端主动建立。
    Outbound,
}

/// 关联的终止原因，先发生者生效。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// 本地调用 `close` 或传输关闭。
    Local,
    /// 对端有序关闭写方向。
    RemoteClosed,
    /// 对端声明的帧长度越过硬上限。
    FrameViolation { declared: u64, limit: usize },
    /// 读写过程中的 I/O 故障。
    Io { detail: String },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::RemoteClosed => f.write_str("remote-closed"),
            Self::FrameViolation { declared, limit } => {
                write!(f, "frame-violation(declared={declared}, limit={limit})")
            }
            Self::Io { detail } => write!(f, "io({detail})"),
        }
    }
}

#[derive(Debug)]
struct AssociationShared {
    id: AssociationId,
    direction: Direction,
    channel: TcpChannel,
    maximum_frame_size: usize,
    inbound: AsyncMutex<mpsc::Receiver<Frame>>,
    outbound: mpsc::Sender<Bytes>,
    local_close: AtomicBool,
    fault_reported: AtomicBool,
    lifecycle: Arc<PumpLifecycle>,
}

/// 到远端节点的一条逻辑双工通道。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 宿主框架只需面对“发一帧 / 收一帧 / 关闭”，不必关心套接字、缓冲与任务；
/// - 句柄可廉价克隆，发送方与接收方可以位于不同任务。
///
/// ## 逻辑 (How)
/// - `send` 把载荷放入有界出站队列，队列满时等待（背压），关闭时立即失败；
/// - `receive` 从有界入站队列取帧，队列结束后根据终止原因区分“有序结束”与“故障”；
/// - `close` 记录 `Local` 原因并关闭连接，流泵两个方向随即退出。
///
/// ## 契约 (What)
/// - `receive` 返回 `Ok(None)` 表示有序结束，返回 `Err` 表示帧违规或 I/O 故障；
///   故障只报告一次，之后的 `receive` 返回 `Ok(None)`，原因仍可经 `close_reason` 查询；
/// - `close` 返回后不会再交付入站帧，后续 `send` 返回 [`TransportError::ConnectionClosing`]；
/// - `close` 幂等且并发安全，关闭日志只输出一次；
/// - `send` 拒绝超过 `maximum-frame-size` 的载荷，但不影响关联本身。
///
/// ## 注意事项 (Trade-offs)
/// - `send` 成功只代表已入队；关闭时仍在队列中的帧会被丢弃。
#[derive(Clone, Debug)]
pub struct AssociationHandle {
    shared: Arc<AssociationShared>,
}

impl AssociationHandle {
    /// 对已建立的连接完成握手并启动流泵。
    ///
    /// 握手阶段在 `connection-timeout` 内等待套接字可写；超时或失败时连接被关闭。
    pub(crate) async fn establish(
        channel: TcpChannel,
        direction: Direction,
        settings: &Settings,
    ) -> Result<Self> {
        let ctx = CallContext::builder()
            .with_cancellation(channel.closed_signal().clone())
            .with_timeout(settings.connection_timeout())
            .build();
        if let Err(err) = channel.await_writable(&ctx).await {
            channel.close();
            return Err(err);
        }

        let id = AssociationId::next();
        let endpoints = pump::spawn(channel.clone(), settings, id);
        debug!(
            association = %id,
            direction = ?direction,
            local = %channel.local_addr(),
            peer = %channel.peer_addr(),
            "association established"
        );
        Ok(Self {
            shared: Arc::new(AssociationShared {
                id,
                direction,
                channel,
                maximum_frame_size: settings.maximum_frame_size(),
                inbound: AsyncMutex::new(endpoints.inbound),
                outbound: endpoints.outbound,
                local_close: AtomicBool::new(false),
                fault_reported: AtomicBool::new(false),
                lifecycle: endpoints.lifecycle,
            }),
        })
    }

    /// 提交一帧载荷。
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > self.shared.maximum_frame_size {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                limit: self.shared.maximum_frame_size,
            });
        }
        if self.is_closed() {
            return Err(TransportError::ConnectionClosing);
        }
        let closed = self.shared.channel.closed_signal();
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(TransportError::ConnectionClosing),
            sent = self.shared.outbound.send(payload) => {
                sent.map_err(|_| TransportError::ConnectionClosing)
            }
        }
    }

    /// 等待下一帧。
    pub async fn receive(&self) -> Result<Option<Frame>> {
        if self.shared.local_close.load(Ordering::Acquire) {
            return Ok(None);
        }
        let next = {
            let mut inbound = self.shared.inbound.lock().await;
            inbound.recv().await
        };
        // 等待期间可能已被本地关闭，此后不再交付任何帧。
        if self.shared.local_close.load(Ordering::Acquire) {
            return Ok(None);
        }
        let Some(frame) = next else {
            // 故障只上报给第一个观察到队列结束的调用方，之后按已结束处理。
            if self.shared.fault_reported.swap(true, Ordering::AcqRel) {
                return Ok(None);
            }
            return match self.shared.lifecycle.reason() {
                Some(CloseReason::FrameViolation { declared, limit }) => {
                    Err(TransportError::FrameTooLarge { declared, limit })
                }
                Some(CloseReason::Io { detail }) => Err(TransportError::Faulted { detail }),
                _ => Ok(None),
            };
        };
        Ok(Some(frame))
    }

    /// 关闭关联；仅首次调用返回 `true`。
    pub fn close(&self) -> bool {
        if self.shared.local_close.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.lifecycle.record(CloseReason::Local);
        self.shared.channel.close();
        true
    }

    /// 等待关联终止（两个方向的任务都已退出），返回终止原因。
    pub async fn closed(&self) -> CloseReason {
        self.shared.lifecycle.wait().await
    }

    /// 关联是否已经开始关闭。
    pub fn is_closed(&self) -> bool {
        self.shared.local_close.load(Ordering::Acquire) || self.shared.channel.is_closed()
    }

    /// 终止原因；尚未终止时为 `None`。
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.lifecycle.reason()
    }

    pub fn id(&self) -> AssociationId {
        self.shared.id
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.channel.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.channel.peer_addr()
    }
}
