use crate::{
    channel::{TcpChannel, TcpSocketConfig},
    context::{CallContext, Cancellation},
    error::{
        CONNECT, ConnectErrorKind, RESOLVE, Result, TransportError, classify_connect_error,
        map_io_error,
    },
    settings::Settings,
    util::with_context,
};
use std::{io, net::SocketAddr};
use tokio::net::TcpSocket;
use tracing::debug;

/// 在 `ctx` 的截止时间内建立到 `remote` 的出站连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 宿主的重连策略需要区分“超时”“被拒绝”“不可达”，因此失败统一折叠为
///   [`TransportError::Connect`] 并携带 [`ConnectErrorKind`]；
/// - 收发缓冲需在 `connect` 之前设置，窗口缩放因子在握手时协商，事后修改不再生效。
///
/// ## 逻辑 (How)
/// - 通过 Tokio [`TcpSocket`] 创建套接字并预设缓冲与 keepalive；
/// - 建连经 [`with_context`] 与截止时间竞速，超时后未完成的套接字随 Future 一同释放；
/// - 成功后交给 [`TcpChannel::from_stream`] 落地其余选项。
///
/// ## 契约 (What)
/// - 超时返回 `Connect { kind: Timeout }`，取消返回 [`TransportError::Cancelled`]；
/// - `closed` 成为新连接的关闭令牌。
pub(crate) async fn connect(
    ctx: &CallContext,
    remote: SocketAddr,
    settings: &Settings,
    closed: Cancellation,
) -> Result<TcpChannel> {
    let socket = prepare_socket(remote, settings).map_err(|err| connect_error(remote, &err))?;
    let attempt = with_context(ctx, CONNECT, async {
        socket
            .connect(remote)
            .await
            .map_err(|err| connect_error(remote, &err))
    })
    .await;

    let stream = match attempt {
        Ok(stream) => stream,
        Err(TransportError::Timeout { .. }) => {
            return Err(TransportError::Connect {
                remote: remote.to_string(),
                kind: ConnectErrorKind::Timeout,
                detail: format!(
                    "no connection within {:?}",
                    settings.connection_timeout()
                ),
            });
        }
        Err(err) => return Err(err),
    };
    debug!(peer = %remote, "outbound connection established");
    TcpChannel::from_stream(
        stream,
        TcpSocketConfig::from_settings(settings),
        settings.stream_write_buffer_size(),
        closed,
    )
}

/// 解析主机名后依次尝试每个地址，直到成功或截止时间耗尽。
pub(crate) async fn connect_host(
    ctx: &CallContext,
    host: &str,
    port: u16,
    settings: &Settings,
    closed: Cancellation,
) -> Result<TcpChannel> {
    let target = format!("{host}:{port}");
    let resolved = with_context(ctx, RESOLVE, async {
        tokio::net::lookup_host((host, port))
            .await
            .map(|addrs| addrs.collect::<Vec<_>>())
            .map_err(|err| map_io_error(RESOLVE, err))
    })
    .await;
    let addrs = match resolved {
        Ok(addrs) => addrs,
        Err(TransportError::Timeout { .. }) => {
            return Err(TransportError::Connect {
                remote: target,
                kind: ConnectErrorKind::Timeout,
                detail: "name resolution timed out".to_string(),
            });
        }
        Err(TransportError::Io { source, .. }) => {
            return Err(TransportError::Connect {
                remote: target,
                kind: ConnectErrorKind::Unreachable,
                detail: source.to_string(),
            });
        }
        Err(err) => return Err(err),
    };

    let mut last = TransportError::Connect {
        remote: target,
        kind: ConnectErrorKind::Unreachable,
        detail: "host resolved to no addresses".to_string(),
    };
    for addr in addrs {
        match connect(ctx, addr, settings, closed.clone()).await {
            Ok(channel) => return Ok(channel),
            Err(err) if err.connect_kind() == Some(ConnectErrorKind::Timeout) => return Err(err),
            Err(err @ TransportError::Connect { .. }) => {
                debug!(peer = %addr, error = %err, "connect attempt failed, trying next address");
                last = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last)
}

fn prepare_socket(remote: SocketAddr, settings: &Settings) -> io::Result<TcpSocket> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(bytes) = settings.send_buffer_size() {
        socket.set_send_buffer_size(u32::try_from(bytes).unwrap_or(u32::MAX))?;
    }
    if let Some(bytes) = settings.receive_buffer_size() {
        socket.set_recv_buffer_size(u32::try_from(bytes).unwrap_or(u32::MAX))?;
    }
    socket.set_keepalive(settings.tcp_keepalive())?;
    Ok(socket)
}

fn connect_error(remote: SocketAddr, err: &io::Error) -> TransportError {
    TransportError::Connect {
        remote: remote.to_string(),
        kind: classify_connect_error(err),
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn settings() -> Settings {
        Settings::builder()
            .hostname("127.0.0.1")
            .port(0)
            .connection_timeout(Duration::from_millis(500))
            .build()
            .expect("合法配置")
    }

    fn ctx(settings: &Settings) -> CallContext {
        CallContext::builder()
            .with_timeout(settings.connection_timeout())
            .build()
    }

    #[tokio::test]
    async fn connects_and_applies_socket_options() {
        let settings = settings();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("绑定回环地址");
        let addr = listener.local_addr().expect("读取监听地址");
        let channel = connect(&ctx(&settings), addr, &settings, Cancellation::new())
            .await
            .expect("建连应成功");
        assert_eq!(channel.peer_addr(), addr);
        assert!(channel.applied_options().nodelay());
    }

    #[tokio::test]
    async fn closed_port_is_reported_as_refused() {
        let settings = settings();
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .expect("绑定回环地址");
            listener.local_addr().expect("读取监听地址")
        };
        let err = connect(&ctx(&settings), addr, &settings, Cancellation::new())
            .await
            .expect_err("端口已关闭");
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Refused));
    }

    #[tokio::test]
    async fn cancelled_context_abandons_connect() {
        let settings = settings();
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let ctx = CallContext::builder().with_cancellation(cancellation).build();
        let addr: SocketAddr = "127.0.0.1:9".parse().expect("合法地址");
        let err = connect(&ctx, addr, &settings, Cancellation::new())
            .await
            .expect_err("已取消");
        assert!(matches!(err, TransportError::Cancelled { op } if op == CONNECT));
    }

    #[tokio::test]
    async fn host_names_are_resolved() {
        let settings = settings();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("绑定回环地址");
        let port = listener.local_addr().expect("读取监听地址").port();
        let channel = connect_host(&ctx(&settings), "127.0.0.1", port, &settings, Cancellation::new())
            .await
            .expect("解析并建连");
        assert_eq!(channel.peer_addr().port(), port);
    }
}
