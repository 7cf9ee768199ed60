#![doc = r#"
# netstream-transport

## 设计动机（Why）
- **定位**：为远程 Actor 框架提供可插拔的数据面：把监听地址变成入站连接，把对端地址变成出站连接，
  并在每条连接上以有界、分帧的方式双向搬运任意大小的不透明消息。
- **架构角色**：位于宿主框架（Actor 模型、序列化、寻址）之下、操作系统套接字之上；
  不解释消息内容，不提供加密。
- **设计理念**：每个会阻塞的网络操作都显式携带 [`CallContext`]（取消 + 截止），
  结果只可能是“完成 / 超时 / 取消”三者之一，绝不无限挂起。

## 核心契约（What）
- **线上格式**：`[u32 大端长度][payload]`，除此之外没有任何字节；
- **帧上限**：声明长度超过 `frame-size-hard-limit` 时连接被关闭；介于 `maximum-frame-size`
  与硬上限之间的帧照常交付并打上标记；
- **顺序**：每条关联、每个方向严格 FIFO；不同关联之间没有顺序保证；
- **隔离**：单条连接的失败只关闭它自己，只有监听套接字失效才是传输级故障。

## 实现策略（How）
- **组件链路**：`Listener`/`initiator` → [`TcpChannel`] → 流泵（入站/出站两个任务 + [`FrameCodec`]）
  → [`AssociationHandle`] → 宿主；
- **并发模型**：每条关联两个 Tokio 任务，跨任务状态只有两条有界 `mpsc` 队列与一次写入的终止原因；
- **关闭链路**：传输根取消令牌派生出每条连接的关闭令牌，[`NetworkStreamTransport::shutdown`]
  一次取消即可打断全部在途 I/O，然后等待所有任务退出。

## 风险与考量（Trade-offs）
- **内存**：小于分块阈值的帧一次读满，大帧按读缓冲分块累积；单帧内存占用以硬上限为界；
- **背压**：入站队列满时停止读取套接字，依赖 TCP 流控放慢对端，慢消费者会拖慢该连接的对端写入；
- **日志**：内部仅使用 `tracing` 宏，是否输出由宿主决定，独立运行时可调用 [`telemetry::install`]。
"#]

mod association;
mod channel;
mod codec;
mod context;
pub mod error;
mod initiator;
mod listener;
mod pump;
mod registry;
mod settings;
pub mod telemetry;
mod transport;
mod util;

pub use association::{AssociationHandle, AssociationId, CloseReason, Direction};
pub use channel::{TcpChannel, TcpSocketConfig};
pub use codec::{Frame, FrameCodec, LENGTH_FIELD_LEN, MAX_FRAME_SIZE_HARD_LIMIT};
pub use context::{CallContext, CallContextBuilder, Cancellation, Deadline};
pub use error::{ConnectErrorKind, ErrorCategory, OperationKind, Result, TransportError};
pub use listener::{InboundAssociations, ListenerState};
pub use settings::{
    DEFAULT_FRAME_SIZE_HARD_LIMIT, MINIMUM_MAXIMUM_FRAME_SIZE, Settings, SettingsBuilder,
};
pub use transport::NetworkStreamTransport;
pub use util::with_context;
