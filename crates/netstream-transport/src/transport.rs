use crate::{
    association::{AssociationHandle, Direction},
    channel::TcpChannel,
    context::{CallContext, Cancellation},
    error::{Result, TransportError},
    initiator,
    listener::{InboundAssociations, Listener, ListenerState},
    registry::AssociationRegistry,
    settings::Settings,
};
use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// 传输的对外门面：监听、建立关联、关闭。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 宿主以显式工厂 `NetworkStreamTransport::new(settings)` 装配传输，不经过反射或配置字符串；
/// - 全部关联共享一个根取消令牌，关闭传输即可一次性打断所有在途 I/O 与建连。
///
/// ## 逻辑 (How)
/// - `listen`：创建监听器、绑定并启动接受循环；
/// - `associate`：在 `connection-timeout` 内建连，完成握手后登记到注册表；
/// - `shutdown`：取消根令牌 → 关闭监听器并等待接受循环 → 关闭所有登记的关联并等待其任务退出。
///
/// ## 契约 (What)
/// - `listen` 只能成功调用一次；
/// - `shutdown` 幂等，返回时不再有属于本传输的后台任务在运行；此后 `listen`/`associate`
///   返回 [`TransportError::InvalidState`]。
///
/// ## 注意事项 (Trade-offs)
/// - 丢弃传输而不调用 `shutdown` 时只会触发根令牌，后台任务随之退出但不会被等待。
#[derive(Debug)]
pub struct NetworkStreamTransport {
    settings: Arc<Settings>,
    root: Cancellation,
    registry: Arc<AssociationRegistry>,
    listener: AsyncMutex<Option<Listener>>,
    bound: OnceLock<SocketAddr>,
    shut_down: AtomicBool,
}

impl NetworkStreamTransport {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            root: Cancellation::new(),
            registry: Arc::new(AssociationRegistry::new()),
            listener: AsyncMutex::new(None),
            bound: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// 绑定并开始接受入站连接。
    pub async fn listen(&self) -> Result<(SocketAddr, InboundAssociations)> {
        self.ensure_running()?;
        let mut slot = self.listener.lock().await;
        if slot.is_some() {
            return Err(TransportError::InvalidState("transport is already listening"));
        }
        let mut listener = Listener::new(Arc::clone(&self.settings), self.root.clone());
        let local = listener.bind().await?;
        let inbound = listener.start(Arc::clone(&self.registry))?;
        *slot = Some(listener);
        let _ = self.bound.set(local);
        Ok((local, inbound))
    }

    /// 监听器当前状态；尚未调用 `listen` 时为 `Unbound`。
    pub async fn listener_state(&self) -> ListenerState {
        match self.listener.lock().await.as_ref() {
            Some(listener) => listener.state(),
            None if self.shut_down.load(Ordering::Acquire) => ListenerState::Closed,
            None => ListenerState::Unbound,
        }
    }

    /// 监听器因致命错误停止接受时返回该错误。
    ///
    /// 尚未监听、仍在接受或传输已关闭时为 `None`；[`InboundAssociations::next`] 也会报告同一错误。
    pub async fn listener_error(&self) -> Option<TransportError> {
        self.listener.lock().await.as_ref().and_then(Listener::failure)
    }

    /// 应对外发布的地址：`public-hostname` 与端口。
    ///
    /// `port = 0` 时使用实际绑定端口；绑定前返回配置值。
    pub fn advertised_address(&self) -> (&str, u16) {
        let port = match (self.settings.port(), self.bound.get()) {
            (0, Some(bound)) => bound.port(),
            (port, _) => port,
        };
        (self.settings.public_hostname(), port)
    }

    /// 建立到 `remote` 的出站关联。
    pub async fn associate(&self, remote: SocketAddr) -> Result<AssociationHandle> {
        self.ensure_running()?;
        let ctx = self.connect_context();
        let channel = initiator::connect(&ctx, remote, &self.settings, self.root.child()).await?;
        self.admit(channel).await
    }

    /// 解析主机名后建立出站关联。
    pub async fn associate_host(&self, host: &str, port: u16) -> Result<AssociationHandle> {
        self.ensure_running()?;
        let ctx = self.connect_context();
        let channel =
            initiator::connect_host(&ctx, host, port, &self.settings, self.root.child()).await?;
        self.admit(channel).await
    }

    /// 仍存活的关联数量。
    pub fn live_associations(&self) -> usize {
        self.registry.len()
    }

    /// 关闭传输并等待所有后台任务退出。
    pub async fn shutdown(&self) {
        let first = !self.shut_down.swap(true, Ordering::AcqRel);
        self.root.cancel();

        let listener = self.listener.lock().await.take();
        if let Some(mut listener) = listener {
            listener.close().await;
        }

        let handles = self.registry.snapshot();
        for handle in &handles {
            handle.close();
        }
        for handle in &handles {
            handle.closed().await;
            self.registry.remove(handle.id());
        }
        if first {
            info!(closed = handles.len(), "transport shut down");
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::InvalidState("transport is shut down"));
        }
        Ok(())
    }

    fn connect_context(&self) -> CallContext {
        CallContext::builder()
            .with_cancellation(self.root.child())
            .with_timeout(self.settings.connection_timeout())
            .build()
    }

    async fn admit(&self, channel: TcpChannel) -> Result<AssociationHandle> {
        let handle = AssociationHandle::establish(channel, Direction::Outbound, &self.settings).await?;
        self.registry.track(&handle);
        debug!(association = %handle.id(), peer = %handle.remote_addr(), "outbound association registered");
        Ok(handle)
    }
}

impl Drop for NetworkStreamTransport {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::builder()
            .hostname("127.0.0.1")
            .public_hostname("node-a.example")
            .port(0)
            .build()
            .expect("合法配置")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn advertised_address_uses_bound_port_for_ephemeral_ports() {
        let transport = NetworkStreamTransport::new(settings());
        assert_eq!(transport.advertised_address(), ("node-a.example", 0));
        assert_eq!(transport.listener_state().await, ListenerState::Unbound);
        let (local, _inbound) = transport.listen().await.expect("监听");
        assert_eq!(
            transport.advertised_address(),
            ("node-a.example", local.port())
        );
        assert_eq!(transport.listener_state().await, ListenerState::Accepting);
        assert!(matches!(
            transport.listen().await,
            Err(TransportError::InvalidState(_))
        ));
        assert!(transport.listener_error().await.is_none());
        transport.shutdown().await;
        assert_eq!(transport.listener_state().await, ListenerState::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn operations_after_shutdown_are_rejected() {
        let transport = NetworkStreamTransport::new(settings());
        transport.shutdown().await;
        transport.shutdown().await;
        let remote: SocketAddr = "127.0.0.1:9".parse().expect("合法地址");
        assert!(matches!(
            transport.associate(remote).await,
            Err(TransportError::InvalidState(_))
        ));
        assert!(matches!(
            transport.listen().await,
            Err(TransportError::InvalidState(_))
        ));
    }
}
