use crate::{
    context::{CallContext, Cancellation},
    error::{CONFIGURE, HANDSHAKE, READ, Result, TransportError, WRITE, map_io_error},
    settings::Settings,
    util::{run_with_context, with_context},
};
use socket2::SockRef;
use std::{
    io,
    net::{Shutdown, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 `TCP_NODELAY`、`SO_KEEPALIVE`、`SO_SNDBUF`、`SO_RCVBUF` 收敛为一个值对象，
///   入站与出站连接走同一条落地路径；
/// - 调用方无需直接操作 `socket2` 或平台相关常量。
///
/// ## 核心逻辑（How）
/// - `apply` 通过 Tokio 设置 `TCP_NODELAY`，其余选项借助 [`SockRef`] 写入内核；
/// - 缓冲大小为 `None` 时不触碰内核默认值。
///
/// ## 契约说明（What）
/// - **前置条件**：调用 `apply` 前套接字必须已成功创建；
/// - **后置条件**：`apply` 返回 `Ok(())` 时所有选项均已落地，失败时连接应被丢弃。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - 内核可能对缓冲大小取整或加倍（Linux 会翻倍记账），这里记录的是请求值而非内核实际值。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TcpSocketConfig {
    nodelay: bool,
    keepalive: bool,
    send_buffer_size: Option<usize>,
    receive_buffer_size: Option<usize>,
}

impl TcpSocketConfig {
    /// 创建全部关闭、缓冲沿用内核默认的配置。
    pub const fn new() -> Self {
        Self {
            nodelay: false,
            keepalive: false,
            send_buffer_size: None,
            receive_buffer_size: None,
        }
    }

    /// 从传输配置提取套接字选项。
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            nodelay: settings.tcp_nodelay(),
            keepalive: settings.tcp_keepalive(),
            send_buffer_size: settings.send_buffer_size(),
            receive_buffer_size: settings.receive_buffer_size(),
        }
    }

    pub fn with_nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    pub fn with_keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = enabled;
        self
    }

    pub fn with_send_buffer_size(mut self, bytes: Option<usize>) -> Self {
        self.send_buffer_size = bytes;
        self
    }

    pub fn with_receive_buffer_size(mut self, bytes: Option<usize>) -> Self {
        self.receive_buffer_size = bytes;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.receive_buffer_size
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let sock = SockRef::from(stream);
        sock.set_keepalive(self.keepalive)?;
        if let Some(bytes) = self.send_buffer_size {
            sock.set_send_buffer_size(bytes)?;
        }
        if let Some(bytes) = self.receive_buffer_size {
            sock.set_recv_buffer_size(bytes)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TcpChannelInner {
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: TcpSocketConfig,
    write_chunk: usize,
    io_ctx: CallContext,
    shut: AtomicBool,
}

/// 单条 TCP 连接的全双工封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为流泵提供“读一段 / 写全部 / 关闭”三个原语，读写两个方向可以真正并发；
/// - 关闭必须能打断正在进行中的读写，否则关闭流程会被一条卡死的连接拖住。
///
/// ## 逻辑 (How)
/// - 不使用互斥锁，读写分别基于 `readable`/`try_read` 与 `writable`/`try_write`，
///   二者只需要 `&TcpStream`，入站任务与出站任务各自持有一个克隆；
/// - 每个读写都经由 [`run_with_context`] 与连接级取消令牌竞速；
/// - `close` 先触发取消令牌唤醒进行中的读写，再对套接字执行双向 `shutdown`。
///
/// ## 契约 (What)
/// - `read_some`：返回读取字节数，`0` 表示对端有序关闭；
/// - `write_all`：仅当全部字节被内核接受后返回，内部按 `stream-write-buffer-size` 分块并重试
///   `WouldBlock`/`Interrupted`；
/// - 关闭之后的读写立即返回 [`TransportError::ConnectionClosed`]；
/// - `close` 幂等，仅首次调用返回 `true`。
///
/// ## 注意事项 (Trade-offs)
/// - 连接级取消令牌通常派生自传输的根令牌，传输关闭时所有连接的读写一并被打断，
///   但套接字的 `shutdown` 仍由拥有者（流泵）调用 `close` 完成。
#[derive(Clone, Debug)]
pub struct TcpChannel {
    inner: Arc<TcpChannelInner>,
}

impl TcpChannel {
    /// 包装已建立的流并应用套接字选项。
    ///
    /// `closed` 为连接级取消令牌；`write_chunk` 为单次写入的最大字节数，0 按 1 处理。
    pub fn from_stream(
        stream: TcpStream,
        config: TcpSocketConfig,
        write_chunk: usize,
        closed: Cancellation,
    ) -> Result<Self> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let io_ctx = CallContext::builder().with_cancellation(closed).build();
        Ok(Self {
            inner: Arc::new(TcpChannelInner {
                stream,
                local_addr,
                peer_addr,
                config,
                write_chunk: write_chunk.max(1),
                io_ctx,
                shut: AtomicBool::new(false),
            }),
        })
    }

    /// 读取一段字节到 `buf`，返回读取长度；`0` 表示对端已关闭写方向。
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let stream = &self.inner.stream;
        let read = run_with_context(&self.inner.io_ctx, READ, async {
            loop {
                stream.readable().await?;
                match stream.try_read(buf) {
                    Ok(n) => return Ok(n),
                    Err(err) if is_retryable(&err) => continue,
                    Err(err) => return Err(err),
                }
            }
        })
        .await;
        match read {
            // 本地关闭后 shutdown 造成的 EOF 或错误都按“已关闭”上报。
            Ok(0) if self.is_closed() => Err(TransportError::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(err) => Err(self.closed_or(err)),
        }
    }

    /// 写出全部字节。
    pub async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let stream = &self.inner.stream;
        let chunk = self.inner.write_chunk;
        run_with_context(&self.inner.io_ctx, WRITE, async {
            let mut offset = 0;
            while offset < bytes.len() {
                let end = bytes.len().min(offset + chunk);
                stream.writable().await?;
                match stream.try_write(&bytes[offset..end]) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => offset += n,
                    Err(err) if is_retryable(&err) => continue,
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })
        .await
        .map_err(|err| self.closed_or(err))
    }

    /// 握手探测：在 `ctx` 的截止时间内等待套接字可写。
    ///
    /// `ctx` 的取消信号与连接自身的关闭信号任一触发都会结束等待。
    pub async fn await_writable(&self, ctx: &CallContext) -> Result<()> {
        let stream = &self.inner.stream;
        let closed = &self.inner.io_ctx;
        with_context(ctx, HANDSHAKE, run_with_context(closed, HANDSHAKE, stream.writable()))
            .await
            .map_err(|err| self.closed_or(err))
    }

    /// 关闭连接，唤醒所有进行中的读写。
    ///
    /// 返回 `true` 表示本次调用执行了实际关闭。
    pub fn close(&self) -> bool {
        if self.inner.shut.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.io_ctx.cancellation().cancel();
        if let Err(err) = SockRef::from(&self.inner.stream).shutdown(Shutdown::Both)
            && err.kind() != io::ErrorKind::NotConnected
        {
            debug!(peer = %self.inner.peer_addr, error = %err, "tcp shutdown failed");
        }
        true
    }

    /// 连接是否已关闭（本地关闭或传输关闭）。
    pub fn is_closed(&self) -> bool {
        self.inner.io_ctx.cancellation().is_cancelled()
    }

    /// 连接级取消令牌，关闭时触发。
    pub fn closed_signal(&self) -> &Cancellation {
        self.inner.io_ctx.cancellation()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// 构造时落地的套接字选项。
    pub fn applied_options(&self) -> &TcpSocketConfig {
        &self.inner.config
    }

    fn closed_or(&self, err: TransportError) -> TransportError {
        if self.is_closed() {
            return TransportError::ConnectionClosed;
        }
        err
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
