//! # pump 模块说明
//!
//! ## 角色定位（Why）
//! - 每条连接两个任务：入站任务负责“读字节 → 解码 → 入队”，出站任务负责“出队 → 编码 → 写字节”；
//! - 两个方向互不等待，各自保持 FIFO，队列有界，背压沿队列自然传递到 TCP 窗口。
//!
//! ## 生命周期（What）
//! - 任一方向退出都会关闭连接，另一方向随即因读写被打断而退出；
//! - 首个退出方向记录终止原因（先到先得），两个方向都退出后才对外发布“已关闭”，
//!   因此 `closed()` 解除等待时连接上已没有在途 I/O。

use crate::{
    association::{AssociationId, CloseReason},
    channel::TcpChannel,
    codec::{Frame, FrameCodec, LENGTH_FIELD_LEN},
    error::{Result, TransportError},
    settings::Settings,
};
use bytes::{Bytes, BytesMut};
use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, debug_span, warn};

/// 两个方向共享的终止状态。
#[derive(Debug)]
pub(crate) struct PumpLifecycle {
    id: AssociationId,
    peer: SocketAddr,
    reason: OnceLock<CloseReason>,
    remaining: AtomicUsize,
    done: watch::Sender<Option<CloseReason>>,
}

impl PumpLifecycle {
    fn new(id: AssociationId, peer: SocketAddr) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            id,
            peer,
            reason: OnceLock::new(),
            remaining: AtomicUsize::new(2),
            done,
        }
    }

    /// 记录终止原因，仅首次生效。
    pub(crate) fn record(&self, reason: CloseReason) -> bool {
        self.reason.set(reason).is_ok()
    }

    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.reason.get().cloned()
    }

    /// 等待两个方向全部退出，返回终止原因。
    pub(crate) async fn wait(&self) -> CloseReason {
        let mut rx = self.done.subscribe();
        let published = match rx.wait_for(Option::is_some).await {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        published
            .or_else(|| self.reason())
            .unwrap_or(CloseReason::Local)
    }

    fn finish_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let reason = self.reason().unwrap_or(CloseReason::Local);
        debug!(association = %self.id, peer = %self.peer, reason = %reason, "association closed");
        self.done.send_replace(Some(reason));
    }
}

/// 方向任务的退出守卫。
///
/// 放在 `Drop` 中保证任务被中止或 panic 时依然关闭连接并完成计数，`closed()` 不会永久挂起。
struct LoopExit {
    lifecycle: Arc<PumpLifecycle>,
    channel: TcpChannel,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        self.lifecycle.record(CloseReason::Io {
            detail: "stream pump task aborted".to_string(),
        });
        self.channel.close();
        self.lifecycle.finish_one();
    }
}

/// 流泵启动后交给关联句柄的端点。
pub(crate) struct PumpEndpoints {
    pub(crate) inbound: mpsc::Receiver<Frame>,
    pub(crate) outbound: mpsc::Sender<Bytes>,
    pub(crate) lifecycle: Arc<PumpLifecycle>,
}

/// 为一条已完成握手的连接启动入站与出站任务。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - **前置条件**：处于 Tokio 运行时内，`channel` 尚未关闭；
/// - **后置条件**：返回的入站队列容量为 `inbound-queue-capacity`，出站队列容量为
///   `outbound-queue-capacity`；任务的全部退出路径都会关闭 `channel`。
///
/// ## 实现逻辑（How）
/// - 入站队列满时入站任务停在 `send` 上，不再发起套接字读取，内核接收缓冲随之填满，
///   对端的写入被 TCP 流控放慢；
/// - 出站任务只在队列与关闭信号之间等待，单写者保证帧不会交错。
pub(crate) fn spawn(channel: TcpChannel, settings: &Settings, id: AssociationId) -> PumpEndpoints {
    let codec = FrameCodec::new(settings);
    let write_chunk = settings.stream_write_buffer_size();
    let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_queue_capacity());
    let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue_capacity());
    let lifecycle = Arc::new(PumpLifecycle::new(id, channel.peer_addr()));

    {
        let exit = LoopExit {
            lifecycle: Arc::clone(&lifecycle),
            channel: channel.clone(),
        };
        tokio::spawn(
            async move {
                let reason = run_inbound(&exit.channel, codec, &inbound_tx, id).await;
                exit.lifecycle.record(reason);
                // 先记录原因再释放发送端，消费者看到队列结束时一定能读到原因。
                drop(inbound_tx);
                drop(exit);
            }
            .instrument(debug_span!("stream_pump", association = %id, direction = "inbound")),
        );
    }
    {
        let exit = LoopExit {
            lifecycle: Arc::clone(&lifecycle),
            channel,
        };
        tokio::spawn(
            async move {
                let reason =
                    run_outbound(&exit.channel, codec, outbound_rx, write_chunk, id).await;
                exit.lifecycle.record(reason);
                drop(exit);
            }
            .instrument(debug_span!("stream_pump", association = %id, direction = "outbound")),
        );
    }

    PumpEndpoints {
        inbound: inbound_rx,
        outbound: outbound_tx,
        lifecycle,
    }
}

async fn run_inbound(
    channel: &TcpChannel,
    codec: FrameCodec,
    tx: &mpsc::Sender<Frame>,
    id: AssociationId,
) -> CloseReason {
    let mut buffer = BytesMut::new();
    loop {
        loop {
            match codec.decode(&mut buffer) {
                Ok(Some(frame)) => {
                    if frame.exceeds_maximum_frame_size() {
                        warn!(
                            association = %id,
                            len = frame.len(),
                            limit = codec.maximum_frame_size(),
                            "inbound frame exceeds maximum-frame-size"
                        );
                    }
                    tokio::select! {
                        biased;
                        _ = channel.closed_signal().cancelled() => return CloseReason::Local,
                        sent = tx.send(frame) => {
                            if sent.is_err() {
                                return CloseReason::Local;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(TransportError::FrameTooLarge { declared, limit }) => {
                    warn!(
                        association = %id,
                        peer = %channel.peer_addr(),
                        declared,
                        limit,
                        "declared frame length exceeds hard limit, closing connection"
                    );
                    return CloseReason::FrameViolation { declared, limit };
                }
                Err(err) => {
                    return CloseReason::Io {
                        detail: err.to_string(),
                    };
                }
            }
        }

        let want = codec.read_hint(&buffer);
        let start = buffer.len();
        buffer.resize(start + want, 0);
        match channel.read_some(&mut buffer[start..]).await {
            Ok(0) => {
                buffer.truncate(start);
                if !buffer.is_empty() {
                    // 半帧不可交付，按故障上报而不是有序结束。
                    warn!(association = %id, pending = buffer.len(), "peer closed mid-frame");
                    return CloseReason::Io {
                        detail: format!("truncated frame: {} bytes pending at eof", buffer.len()),
                    };
                }
                return CloseReason::RemoteClosed;
            }
            Ok(n) => buffer.truncate(start + n),
            Err(TransportError::ConnectionClosed) => return CloseReason::Local,
            Err(err) => {
                warn!(association = %id, error = %err, "inbound read failed");
                return CloseReason::Io {
                    detail: err.to_string(),
                };
            }
        }
    }
}

async fn run_outbound(
    channel: &TcpChannel,
    codec: FrameCodec,
    mut rx: mpsc::Receiver<Bytes>,
    write_chunk: usize,
    id: AssociationId,
) -> CloseReason {
    let reason = loop {
        let payload = tokio::select! {
            biased;
            _ = channel.closed_signal().cancelled() => break CloseReason::Local,
            next = rx.recv() => match next {
                Some(payload) => payload,
                None => break CloseReason::Local,
            },
        };
        match write_frame(channel, &codec, &payload, write_chunk).await {
            Ok(()) => {}
            Err(TransportError::ConnectionClosed) => break CloseReason::Local,
            Err(err) => {
                warn!(association = %id, len = payload.len(), error = %err, "outbound write failed");
                break CloseReason::Io {
                    detail: err.to_string(),
                };
            }
        }
    };
    // 拒绝后续入队，仍在排队的帧随接收端一起丢弃。
    rx.close();
    reason
}

async fn write_frame(
    channel: &TcpChannel,
    codec: &FrameCodec,
    payload: &[u8],
    write_chunk: usize,
) -> Result<()> {
    if LENGTH_FIELD_LEN + payload.len() <= write_chunk {
        // 小帧合并成一次写入，避免长度字段单独成段。
        let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + payload.len());
        codec.encode(payload, &mut buf)?;
        return channel.write_all(&buf).await;
    }
    let header = codec.encode_header(payload.len())?;
    channel.write_all(&header).await?;
    channel.write_all(payload).await
}
