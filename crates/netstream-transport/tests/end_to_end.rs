//! netstream-transport 端到端行为验证。
//!
//! # 教案式说明
//! - **Why**：单元测试覆盖了各组件的局部语义，这里从宿主视角只使用公开 API（`listen` / `associate` /
//!   `send` / `receive` / `shutdown`），确认组件串联后的契约依然成立。
//! - **How**：每个用例在回环地址上启动独立的传输实例，端口取 0 由内核分配，用例之间互不干扰。
//! - **What**：断言失败时 panic，`expect` 文案指出失败阶段。

use netstream_transport::{
    AssociationHandle, CloseReason, ConnectErrorKind, InboundAssociations, ListenerState,
    NetworkStreamTransport, Settings, TransportError,
};
use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{io::AsyncWriteExt, net::TcpStream};

const PATIENCE: Duration = Duration::from_secs(5);

fn loopback_settings() -> Settings {
    Settings::builder()
        .hostname("127.0.0.1")
        .port(0)
        .connection_timeout(Duration::from_secs(2))
        .build()
        .expect("回环配置必须合法")
}

async fn listening(settings: Settings) -> (NetworkStreamTransport, SocketAddr, InboundAssociations) {
    let transport = NetworkStreamTransport::new(settings);
    let (addr, inbound) = transport.listen().await.expect("监听回环地址失败");
    (transport, addr, inbound)
}

async fn accept(inbound: &mut InboundAssociations) -> AssociationHandle {
    tokio::time::timeout(PATIENCE, inbound.next())
        .await
        .expect("等待入站关联超时")
        .expect("监听器不应失败")
        .expect("入站流提前结束")
}

async fn next_payload(handle: &AssociationHandle) -> Vec<u8> {
    tokio::time::timeout(PATIENCE, handle.receive())
        .await
        .expect("等待入站帧超时")
        .expect("接收失败")
        .expect("关联提前结束")
        .into_payload()
        .to_vec()
}

/// 经典场景：ping 往返后，依次发送 0、1、1000、maximum-frame-size - 1 字节的帧，
/// 对端按序收到逐字节一致的内容。
#[tokio::test(flavor = "multi_thread")]
async fn ping_then_sized_frames_arrive_in_order() {
    let settings = loopback_settings();
    let max = settings.maximum_frame_size();
    let (server, addr, mut inbound) = listening(settings.clone()).await;
    let client = NetworkStreamTransport::new(settings);

    let outbound = client.associate(addr).await.expect("建立出站关联失败");
    let accepted = accept(&mut inbound).await;

    outbound.send(&b"ping"[..]).await.expect("发送 ping 失败");
    assert_eq!(next_payload(&accepted).await, b"ping");
    accepted.send(&b"pong"[..]).await.expect("回复 pong 失败");
    assert_eq!(next_payload(&outbound).await, b"pong");

    let sizes = [0usize, 1, 1000, max - 1];
    let payloads: Vec<Vec<u8>> = sizes
        .iter()
        .map(|&len| (0..len).map(|i| (i % 253) as u8).collect())
        .collect();
    let sender = {
        let outbound = outbound.clone();
        let payloads = payloads.clone();
        tokio::spawn(async move {
            for payload in payloads {
                outbound.send(payload).await.expect("发送帧失败");
            }
        })
    };
    for expected in &payloads {
        let received = next_payload(&accepted).await;
        assert_eq!(received.len(), expected.len());
        assert_eq!(&received, expected);
    }
    sender.await.expect("发送任务不应 panic");

    client.shutdown().await;
    server.shutdown().await;
}

/// 对端声明的长度越过硬上限：连接被关闭，接收方看到协议错误。
#[tokio::test(flavor = "multi_thread")]
async fn hard_limit_violation_closes_only_that_connection() {
    let settings = loopback_settings();
    let hard_limit = settings.frame_size_hard_limit();
    let (server, addr, mut inbound) = listening(settings.clone()).await;
    let client = NetworkStreamTransport::new(settings);

    let healthy = client.associate(addr).await.expect("建立健康关联失败");
    let healthy_peer = accept(&mut inbound).await;

    let mut raw = TcpStream::connect(addr).await.expect("裸连接建连失败");
    let victim = accept(&mut inbound).await;
    let declared = u32::try_from(hard_limit + 1).expect("硬上限应在 u32 范围内");
    raw.write_all(&declared.to_be_bytes()).await.expect("写入越界长度失败");

    let err = tokio::time::timeout(PATIENCE, victim.receive())
        .await
        .expect("等待失败超时")
        .expect_err("越界帧必须报错");
    assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    assert!(matches!(
        victim.closed().await,
        CloseReason::FrameViolation { .. }
    ));

    healthy.send(&b"still-alive"[..]).await.expect("健康关联应不受影响");
    assert_eq!(next_payload(&healthy_peer).await, b"still-alive");

    client.shutdown().await;
    server.shutdown().await;
}

/// 两条关联同时收发，互不串帧，关闭其中一条不影响另一条。
#[tokio::test(flavor = "multi_thread")]
async fn associations_are_isolated() {
    let settings = loopback_settings();
    let (server, addr, mut inbound) = listening(settings.clone()).await;
    let client = NetworkStreamTransport::new(settings);

    let first = client.associate(addr).await.expect("第一条关联");
    let first_peer = accept(&mut inbound).await;
    let second = client.associate(addr).await.expect("第二条关联");
    let second_peer = accept(&mut inbound).await;
    assert_eq!(first_peer.remote_addr(), first.local_addr());
    assert_eq!(second_peer.remote_addr(), second.local_addr());

    for round in 0..50u32 {
        first.send(format!("a-{round}").into_bytes()).await.expect("发送 a");
        second.send(format!("b-{round}").into_bytes()).await.expect("发送 b");
    }
    for round in 0..50u32 {
        assert_eq!(next_payload(&first_peer).await, format!("a-{round}").into_bytes());
        assert_eq!(next_payload(&second_peer).await, format!("b-{round}").into_bytes());
    }

    assert!(first.close());
    assert_eq!(
        tokio::time::timeout(PATIENCE, first_peer.closed())
            .await
            .expect("对端应观察到关闭"),
        CloseReason::RemoteClosed
    );
    second.send(&b"after"[..]).await.expect("第二条关联仍可发送");
    assert_eq!(next_payload(&second_peer).await, b"after");

    client.shutdown().await;
    server.shutdown().await;
}

/// 并发关闭同一关联：只有一次成功，终止原因只发布一次。
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_close_is_idempotent() {
    let settings = loopback_settings();
    let (server, addr, mut inbound) = listening(settings.clone()).await;
    let client = NetworkStreamTransport::new(settings);
    let handle = client.associate(addr).await.expect("建立关联");
    let _peer = accept(&mut inbound).await;

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.close() })
        })
        .collect();
    let mut winners = 0;
    for closer in closers {
        if closer.await.expect("关闭任务不应 panic") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(handle.closed().await, CloseReason::Local);
    assert_eq!(handle.close_reason(), Some(CloseReason::Local));
    assert!(handle.receive().await.expect("关闭后不报错").is_none());
    assert!(matches!(
        handle.send(&b"late"[..]).await,
        Err(TransportError::ConnectionClosing)
    ));

    client.shutdown().await;
    server.shutdown().await;
}

/// 对端发出长度字段与半截载荷后断开：接收方看到故障而不是有序结束。
#[tokio::test(flavor = "multi_thread")]
async fn truncated_frame_surfaces_as_fault() {
    let (server, addr, mut inbound) = listening(loopback_settings()).await;
    let mut raw = TcpStream::connect(addr).await.expect("裸连接建连失败");
    let victim = accept(&mut inbound).await;

    raw.write_all(&[0, 0, 0, 100, 1, 2, 3]).await.expect("写入半帧失败");
    drop(raw);

    let err = tokio::time::timeout(PATIENCE, victim.receive())
        .await
        .expect("等待失败超时")
        .expect_err("半帧必须报错");
    assert!(matches!(err, TransportError::Faulted { .. }));
    assert!(matches!(victim.closed().await, CloseReason::Io { .. }));
    assert!(victim.receive().await.expect("故障只报告一次").is_none());

    server.shutdown().await;
}

/// 对端不读取时：入站队列与内核缓冲填满后 `send` 阻塞；阻塞中的 `send` 在关闭时失败。
#[tokio::test(flavor = "multi_thread")]
async fn stalled_peer_blocks_send_until_close() {
    let settings = Settings::builder()
        .hostname("127.0.0.1")
        .port(0)
        .connection_timeout(Duration::from_secs(2))
        .send_buffer_size(4096)
        .receive_buffer_size(4096)
        .inbound_queue_capacity(1)
        .outbound_queue_capacity(1)
        .build()
        .expect("小缓冲配置必须合法");
    let frame = vec![7u8; 32_000];
    let (server, addr, mut inbound) = listening(settings.clone()).await;
    let client = NetworkStreamTransport::new(settings);
    let handle = client.associate(addr).await.expect("建立关联");
    let _stalled_peer = accept(&mut inbound).await;

    let mut completed = 0usize;
    let blocked = loop {
        assert!(completed < 256, "对端从不读取，发送不应无限前进");
        let pending = {
            let handle = handle.clone();
            let frame = frame.clone();
            tokio::spawn(async move { handle.send(frame).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        if !pending.is_finished() {
            break pending;
        }
        pending
            .await
            .expect("发送任务不应 panic")
            .expect("队列未满时发送应成功");
        completed += 1;
    };
    assert!(completed >= 1, "至少应有一帧在阻塞前入队");

    assert!(handle.close());
    let result = tokio::time::timeout(PATIENCE, blocked)
        .await
        .expect("关闭应唤醒阻塞的发送")
        .expect("发送任务不应 panic");
    assert!(matches!(result, Err(TransportError::ConnectionClosing)));

    client.shutdown().await;
    server.shutdown().await;
}

/// 接受队列已满的监听器不回应 SYN：建连在配置的超时附近以 `Timeout` 放弃。
#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
async fn connect_to_saturated_backlog_times_out() {
    let addr: SocketAddr = "127.0.0.1:0".parse().expect("合法地址");
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .expect("创建套接字");
    socket.bind(&addr.into()).expect("绑定");
    socket.listen(0).expect("监听");
    let addr = socket
        .local_addr()
        .expect("读取地址")
        .as_socket()
        .expect("IP 地址");

    // 从不 accept，直到某次建连挂起为止，说明接受队列已满。
    let mut fillers = Vec::new();
    let saturated = loop {
        if fillers.len() >= 16 {
            break false;
        }
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => fillers.push(stream),
            Ok(Err(err)) => panic!("填充连接失败：{err}"),
            Err(_) => break true,
        }
    };
    assert!(saturated, "接受队列未能填满");

    let settings = Settings::builder()
        .hostname("127.0.0.1")
        .port(0)
        .connection_timeout(Duration::from_millis(300))
        .build()
        .expect("合法配置");
    let client = NetworkStreamTransport::new(settings);
    let started = Instant::now();
    let err = client
        .associate(addr)
        .await
        .expect_err("接受队列已满时不应建连成功");
    let elapsed = started.elapsed();

    assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Timeout));
    assert!(elapsed >= Duration::from_millis(250), "过早放弃：{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "超时未及时生效：{elapsed:?}");
    client.shutdown().await;
    drop(fillers);
}

/// 黑洞地址上的建连在配置的超时附近放弃；不可路由的环境下允许直接报告不可达。
///
/// 依赖真实网络路由，透明代理会让建连直接成功，默认不运行。
#[tokio::test(flavor = "multi_thread")]
#[ignore = "依赖真实网络路由"]
async fn connect_to_blackhole_times_out() {
    let settings = Settings::builder()
        .hostname("127.0.0.1")
        .port(0)
        .connection_timeout(Duration::from_millis(200))
        .build()
        .expect("合法配置");
    let client = NetworkStreamTransport::new(settings);
    let blackhole: SocketAddr = "10.255.255.1:2552".parse().expect("合法地址");

    let started = Instant::now();
    let err = client
        .associate(blackhole)
        .await
        .expect_err("黑洞地址不应建连成功");
    let elapsed = started.elapsed();

    assert!(matches!(
        err.connect_kind(),
        Some(ConnectErrorKind::Timeout | ConnectErrorKind::Unreachable)
    ));
    assert!(elapsed < Duration::from_secs(1), "超时未及时生效：{elapsed:?}");
    client.shutdown().await;
}

/// 目标端口无人监听：返回 `Refused`，不是超时。
#[tokio::test(flavor = "multi_thread")]
async fn connect_to_closed_port_is_refused() {
    let addr = {
        let vacant = std::net::TcpListener::bind("127.0.0.1:0").expect("临时绑定");
        vacant.local_addr().expect("读取地址")
    };
    let client = NetworkStreamTransport::new(loopback_settings());
    let err = client.associate(addr).await.expect_err("无人监听");
    assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Refused));
    client.shutdown().await;
}

/// `shutdown` 返回后：监听器关闭、全部关联终止、新的监听与建连被拒绝。
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_quiesces_everything() {
    let settings = loopback_settings();
    let (server, addr, mut inbound) = listening(settings.clone()).await;
    let client = NetworkStreamTransport::new(settings);

    let mut outbound = Vec::new();
    let mut accepted = Vec::new();
    for _ in 0..3 {
        outbound.push(client.associate(addr).await.expect("建立关联"));
        accepted.push(accept(&mut inbound).await);
    }
    assert_eq!(client.live_associations(), 3);

    tokio::time::timeout(PATIENCE, server.shutdown())
        .await
        .expect("关闭应在限定时间内完成");
    assert_eq!(server.listener_state().await, ListenerState::Closed);
    for handle in &accepted {
        assert!(handle.is_closed());
        assert_eq!(handle.close_reason(), Some(CloseReason::Local));
    }
    assert!(inbound.next().await.expect("正常关闭不报错").is_none());
    assert!(server.listener_error().await.is_none());
    assert!(matches!(
        server.associate(addr).await,
        Err(TransportError::InvalidState(_))
    ));

    for handle in &outbound {
        let reason = tokio::time::timeout(PATIENCE, handle.closed())
            .await
            .expect("客户端应观察到对端关闭");
        assert_eq!(reason, CloseReason::RemoteClosed);
    }
    client.shutdown().await;
    assert_eq!(client.live_associations(), 0);
}

/// 宿主以 TOML 文档装配传输，配置项生效。
#[tokio::test(flavor = "multi_thread")]
async fn transport_assembled_from_toml() {
    let settings = Settings::from_toml_str(
        r#"
        hostname = "127.0.0.1"
        public-hostname = "node-b.example"
        port = 0
        connection-timeout-ms = 1000
        maximum-frame-size = 40000
        stream-write-buffer-size = 512
        chunked-read-threshold = 1024
        "#,
    )
    .expect("TOML 配置应可解析");
    let (server, addr, mut inbound) = listening(settings.clone()).await;
    assert_eq!(server.advertised_address(), ("node-b.example", addr.port()));

    let client = NetworkStreamTransport::new(settings);
    let handle = client
        .associate_host("127.0.0.1", addr.port())
        .await
        .expect("按主机名建连");
    let peer = accept(&mut inbound).await;

    let payload = vec![42u8; 39_999];
    handle.send(payload.clone()).await.expect("发送大帧");
    assert_eq!(next_payload(&peer).await, payload);
    assert!(matches!(
        handle.send(vec![0u8; 40_001]).await,
        Err(TransportError::PayloadTooLarge { len: 40_001, limit: 40_000 })
    ));

    client.shutdown().await;
    server.shutdown().await;
}
