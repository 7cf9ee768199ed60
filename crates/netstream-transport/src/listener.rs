use crate::{
    association::{AssociationHandle, Direction},
    channel::{TcpChannel, TcpSocketConfig},
    context::{CallContext, Cancellation},
    error::{
        ACCEPT, BIND, RESOLVE, Result, TransportError, is_transient_accept_error, map_io_error,
    },
    registry::AssociationRegistry,
    settings::Settings,
    util::run_with_context,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle, task::JoinSet};
use tracing::{debug, error, info, warn};

/// 暂时性接受失败后的退避时长。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// 尚未被宿主取走的入站关联上限。
const INBOUND_NOTIFY_CAPACITY: usize = 64;

/// 监听器生命周期：`Unbound → Bound → Accepting → Closed`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    Unbound = 0,
    Bound = 1,
    Accepting = 2,
    Closed = 3,
}

impl ListenerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unbound,
            1 => Self::Bound,
            2 => Self::Accepting,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Accepting => "accepting",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ListenerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ListenerState {
        ListenerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ListenerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// 宿主消费入站关联的通知流。
///
/// 已交付的关联全部被取走后：监听器正常关闭时 `next` 返回 `Ok(None)`；
/// 监听套接字致命失败时先返回一次 [`TransportError::ListenerClosed`]，之后返回 `Ok(None)`。
#[derive(Debug)]
pub struct InboundAssociations {
    rx: mpsc::Receiver<AssociationHandle>,
    failure: Arc<OnceLock<String>>,
    failure_reported: bool,
}

impl InboundAssociations {
    /// 等待下一条入站关联。
    pub async fn next(&mut self) -> Result<Option<AssociationHandle>> {
        if let Some(handle) = self.rx.recv().await {
            return Ok(Some(handle));
        }
        match self.failure.get() {
            Some(detail) if !self.failure_reported => {
                self.failure_reported = true;
                Err(TransportError::ListenerClosed {
                    detail: detail.clone(),
                })
            }
            _ => Ok(None),
        }
    }
}

/// 入站连接的接收端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“绑定 → 接受 → 包装为关联 → 通知宿主”收敛为一个对象，状态机显式可查；
/// - 监听套接字的失败是传输级致命错误，单条连接的失败则只影响它自己。
///
/// ## 逻辑 (How)
/// - `bind`：解析 `bind-hostname`，借助 `socket2` 设置 `SO_REUSEADDR` 与 backlog 后再交给 Tokio；
/// - `start`：派生接受循环任务；每个接受到的套接字在独立任务中完成握手，慢握手不会阻塞接受；
/// - 暂时性失败（描述符耗尽、内核缓冲不足、握手前被对端放弃）记录告警并在退避后重试，
///   其余失败使监听器进入 `Closed`。
///
/// ## 契约 (What)
/// - **前置条件**：`bind` 与 `start` 依次调用各一次，否则返回 [`TransportError::InvalidState`]；
/// - **后置条件**：`close` 返回时接受循环及其派生的握手任务都已结束，监听套接字已释放；
/// - 接受循环因致命错误退出时，错误经 [`InboundAssociations::next`] 与 `failure` 向上传递。
///
/// ## 注意事项 (Trade-offs)
/// - 入站连接的取消令牌派生自传输根令牌而非监听器令牌，关闭监听器不会断开已建立的关联。
#[derive(Debug)]
pub(crate) struct Listener {
    settings: Arc<Settings>,
    state: Arc<StateCell>,
    failure: Arc<OnceLock<String>>,
    stop: Cancellation,
    connections: Cancellation,
    bound: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// 创建处于 `Unbound` 的监听器。
    ///
    /// `connections` 为入站连接取消令牌的父令牌，`stop` 由它派生。
    pub(crate) fn new(settings: Arc<Settings>, connections: Cancellation) -> Self {
        Self {
            settings,
            state: Arc::new(StateCell::new(ListenerState::Unbound)),
            failure: Arc::new(OnceLock::new()),
            stop: connections.child(),
            connections,
            bound: None,
            local_addr: None,
            task: None,
        }
    }

    pub(crate) fn state(&self) -> ListenerState {
        self.state.get()
    }

    /// 接受循环的致命错误；正常关闭或仍在运行时为 `None`。
    pub(crate) fn failure(&self) -> Option<TransportError> {
        self.failure
            .get()
            .map(|detail| TransportError::ListenerClosed {
                detail: detail.clone(),
            })
    }

    /// 绑定监听套接字。
    pub(crate) async fn bind(&mut self) -> Result<SocketAddr> {
        if self.state() != ListenerState::Unbound {
            return Err(TransportError::InvalidState("listener already bound"));
        }
        let host = self.settings.bind_hostname();
        let port = self.settings.bind_port();
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| map_io_error(RESOLVE, err))?
            .next()
            .ok_or_else(|| {
                map_io_error(
                    RESOLVE,
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no address for {host}:{port}"),
                    ),
                )
            })?;

        let listener = bind_socket(addr, &self.settings).map_err(|err| map_io_error(BIND, err))?;
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        self.bound = Some(listener);
        self.local_addr = Some(local);
        self.state.set(ListenerState::Bound);
        info!(local = %local, backlog = self.settings.backlog(), "tcp listener bound");
        Ok(local)
    }

    /// 启动接受循环，返回入站关联通知流。
    pub(crate) fn start(
        &mut self,
        registry: Arc<AssociationRegistry>,
    ) -> Result<InboundAssociations> {
        let listener = match (self.state(), self.bound.take()) {
            (ListenerState::Bound, Some(listener)) => listener,
            _ => return Err(TransportError::InvalidState("listener is not bound")),
        };
        let (tx, rx) = mpsc::channel(INBOUND_NOTIFY_CAPACITY);
        let accept = AcceptLoop {
            listener,
            settings: Arc::clone(&self.settings),
            stop: self.stop.clone(),
            connections: self.connections.clone(),
            registry,
            notify: tx,
            state: Arc::clone(&self.state),
            failure: Arc::clone(&self.failure),
        };
        self.state.set(ListenerState::Accepting);
        self.task = Some(tokio::spawn(accept.run()));
        Ok(InboundAssociations {
            rx,
            failure: Arc::clone(&self.failure),
            failure_reported: false,
        })
    }

    /// 停止接受并释放监听套接字。
    pub(crate) async fn close(&mut self) {
        self.stop.cancel();
        self.bound = None;
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!(error = %err, "accept loop task ended abnormally");
        }
        self.state.set(ListenerState::Closed);
        debug!(local = ?self.local_addr, "tcp listener closed");
    }
}

fn bind_socket(addr: SocketAddr, settings: &Settings) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(settings.tcp_reuse_addr())?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let backlog = i32::try_from(settings.backlog()).unwrap_or(i32::MAX);
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}

struct AcceptLoop {
    listener: TcpListener,
    settings: Arc<Settings>,
    stop: Cancellation,
    connections: Cancellation,
    registry: Arc<AssociationRegistry>,
    notify: mpsc::Sender<AssociationHandle>,
    state: Arc<StateCell>,
    failure: Arc<OnceLock<String>>,
}

impl AcceptLoop {
    async fn run(self) {
        let ctx = CallContext::builder()
            .with_cancellation(self.stop.clone())
            .build();
        let config = TcpSocketConfig::from_settings(&self.settings);
        let local = self.listener.local_addr().ok();
        let mut handshakes = JoinSet::new();

        loop {
            while handshakes.try_join_next().is_some() {}
            match run_with_context(&ctx, ACCEPT, self.listener.accept()).await {
                Ok((stream, peer)) => {
                    let channel = match TcpChannel::from_stream(
                        stream,
                        config.clone(),
                        self.settings.stream_write_buffer_size(),
                        self.connections.child(),
                    ) {
                        Ok(channel) => channel,
                        Err(err) => {
                            warn!(peer = %peer, error = %err, "failed to configure accepted socket");
                            continue;
                        }
                    };
                    handshakes.spawn(admit(
                        channel,
                        Arc::clone(&self.settings),
                        Arc::clone(&self.registry),
                        self.notify.clone(),
                        self.stop.clone(),
                    ));
                }
                Err(err) if err.is_abandoned() => break,
                Err(TransportError::Io { source, .. }) if is_transient_accept_error(&source) => {
                    warn!(local = ?local, error = %source, "transient accept failure, backing off");
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                Err(err) => {
                    error!(local = ?local, error = %err, "accept failed, listener stops accepting");
                    let _ = self.failure.set(err.to_string());
                    break;
                }
            }
        }

        self.state.set(ListenerState::Closed);
        drop(self.listener);
        while handshakes.join_next().await.is_some() {}
    }
}

/// 完成入站握手、登记并通知宿主。
async fn admit(
    channel: TcpChannel,
    settings: Arc<Settings>,
    registry: Arc<AssociationRegistry>,
    notify: mpsc::Sender<AssociationHandle>,
    stop: Cancellation,
) {
    let peer = channel.peer_addr();
    let handle = match AssociationHandle::establish(channel, Direction::Inbound, &settings).await {
        Ok(handle) => handle,
        Err(err) => {
            warn!(peer = %peer, error = %err, "inbound handshake failed");
            return;
        }
    };
    registry.track(&handle);
    tokio::select! {
        biased;
        _ = stop.cancelled() => {
            handle.close();
        }
        sent = notify.send(handle.clone()) => {
            if sent.is_err() {
                debug!(association = %handle.id(), "inbound stream dropped, closing association");
                handle.close();
            }
        }
    }
}
