//! # settings 模块说明
//!
//! ## 角色定位（Why）
//! - 传输所有可调参数的唯一来源：端口、缓冲、超时、帧大小上限；
//! - 构造即校验：非法值在启动期同步失败，运行期不会再出现配置类错误。
//!
//! ## 设计要求（What）
//! - [`Settings`] 一经构造不可变，可在任务之间以 `Arc` 共享；
//! - 字节尺寸取 0 或缺省表示“交由操作系统决定”，仅适用于套接字收发缓冲；
//! - `maximum-frame-size` 低于 32000 字节为致命配置错误。
//!
//! ## 扩展建议（How）
//! - 程序化装配使用 [`SettingsBuilder`]；文件化装配使用 [`Settings::from_toml_str`]，
//!   键名与构建器方法一一对应（kebab-case）。

use crate::{
    codec::MAX_FRAME_SIZE_HARD_LIMIT,
    error::{Result, TransportError},
};
use serde::Deserialize;
use std::time::Duration;

/// `maximum-frame-size` 的下限。
pub const MINIMUM_MAXIMUM_FRAME_SIZE: usize = 32_000;
/// 默认硬上限：64 MiB。
pub const DEFAULT_FRAME_SIZE_HARD_LIMIT: usize = 64 * 1024 * 1024;

pub const DEFAULT_PORT: u16 = 2552;
pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 256_000;
pub const DEFAULT_STREAM_WRITE_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_STREAM_READ_BUFFER_SIZE: usize = 65_536;
pub const DEFAULT_MAXIMUM_FRAME_SIZE: usize = 128_000;
pub const DEFAULT_BACKLOG: u32 = 4096;
pub const DEFAULT_CHUNKED_READ_THRESHOLD: usize = 4096;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 16;


/// 传输参数的不可变快照。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将宿主配置解析后的数值集中在一个只读结构里，任何组件都只依赖它而不依赖配置格式；
/// - `hostname`/`port` 是对外通告的地址，`bind-hostname`/`bind-port` 是实际绑定的地址，
///   两者分离以支持 NAT 与容器端口映射。
///
/// ## 契约（What）
/// - 所有字段通过访问器只读暴露；
/// - `bind_hostname()` 与 `bind_port()` 已完成缺省回退；
/// - `public_hostname()` 缺省等于 `hostname()`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    hostname: String,
    public_hostname: String,
    bind_hostname: String,
    port: u16,
    bind_port: u16,
    connection_timeout: Duration,
    send_buffer_size: Option<usize>,
    receive_buffer_size: Option<usize>,
    stream_write_buffer_size: usize,
    stream_read_buffer_size: usize,
    maximum_frame_size: usize,
    frame_size_hard_limit: usize,
    chunked_read_threshold: usize,
    backlog: u32,
    tcp_nodelay: bool,
    tcp_keepalive: bool,
    tcp_reuse_addr: bool,
    outbound_queue_capacity: usize,
    inbound_queue_capacity: usize,
}

impl Settings {
    /// 创建构建器，初始值为默认配置。
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// 从 TOML 文档加载配置；未出现的键取默认值。
    ///
    /// 字节尺寸以整数字节表示，`connection-timeout-ms` 以毫秒表示。未知键视为配置错误，
    /// 以免拼写错误被静默忽略。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let document: SettingsDocument = toml::from_str(source)
            .map_err(|err| TransportError::configuration("toml", err.to_string()))?;
        document.into_builder()?.build()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// 对外通告的主机名。
    pub fn public_hostname(&self) -> &str {
        &self.public_hostname
    }

    pub fn bind_hostname(&self) -> &str {
        &self.bind_hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bind_port(&self) -> u16 {
        self.bind_port
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// `None` 表示沿用操作系统默认值。
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    /// `None` 表示沿用操作系统默认值。
    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.receive_buffer_size
    }

    pub fn stream_write_buffer_size(&self) -> usize {
        self.stream_write_buffer_size
    }

    pub fn stream_read_buffer_size(&self) -> usize {
        self.stream_read_buffer_size
    }

    pub fn maximum_frame_size(&self) -> usize {
        self.maximum_frame_size
    }

    pub fn frame_size_hard_limit(&self) -> usize {
        self.frame_size_hard_limit
    }

    pub fn chunked_read_threshold(&self) -> usize {
        self.chunked_read_threshold
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay
    }

    pub fn tcp_keepalive(&self) -> bool {
        self.tcp_keepalive
    }

    pub fn tcp_reuse_addr(&self) -> bool {
        self.tcp_reuse_addr
    }

    pub fn outbound_queue_capacity(&self) -> usize {
        self.outbound_queue_capacity
    }

    pub fn inbound_queue_capacity(&self) -> usize {
        self.inbound_queue_capacity
    }
}

/// [`Settings`] 的构建器，`build` 时统一校验。
#[derive(Clone, Debug)]
pub struct SettingsBuilder {
    hostname: String,
    public_hostname: Option<String>,
    bind_hostname: Option<String>,
    port: u16,
    bind_port: Option<u16>,
    connection_timeout: Duration,
    send_buffer_size: usize,
    receive_buffer_size: usize,
    stream_write_buffer_size: usize,
    stream_read_buffer_size: usize,
    maximum_frame_size: usize,
    frame_size_hard_limit: usize,
    chunked_read_threshold: usize,
    backlog: u32,
    tcp_nodelay: bool,
    tcp_keepalive: bool,
    tcp_reuse_addr: bool,
    outbound_queue_capacity: usize,
    inbound_queue_capacity: usize,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            public_hostname: None,
            bind_hostname: None,
            port: DEFAULT_PORT,
            bind_port: None,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            send_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            receive_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            stream_write_buffer_size: DEFAULT_STREAM_WRITE_BUFFER_SIZE,
            stream_read_buffer_size: DEFAULT_STREAM_READ_BUFFER_SIZE,
            maximum_frame_size: DEFAULT_MAXIMUM_FRAME_SIZE,
            frame_size_hard_limit: DEFAULT_FRAME_SIZE_HARD_LIMIT,
            chunked_read_threshold: DEFAULT_CHUNKED_READ_THRESHOLD,
            backlog: DEFAULT_BACKLOG,
            tcp_nodelay: true,
            tcp_keepalive: true,
            tcp_reuse_addr: true,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
        }
    }
}

impl SettingsBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// 覆盖对外通告的主机名；空字符串等价于未设置。
    pub fn public_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.public_hostname = Some(hostname.into());
        self
    }

    /// 覆盖绑定的网卡地址；空字符串等价于未设置。
    pub fn bind_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.bind_hostname = Some(hostname.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn bind_port(mut self, port: Option<u16>) -> Self {
        self.bind_port = port;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// 0 表示沿用操作系统默认值。
    pub fn send_buffer_size(mut self, bytes: usize) -> Self {
        self.send_buffer_size = bytes;
        self
    }

    /// 0 表示沿用操作系统默认值。
    pub fn receive_buffer_size(mut self, bytes: usize) -> Self {
        self.receive_buffer_size = bytes;
        self
    }

    pub fn stream_write_buffer_size(mut self, bytes: usize) -> Self {
        self.stream_write_buffer_size = bytes;
        self
    }

    pub fn stream_read_buffer_size(mut self, bytes: usize) -> Self {
        self.stream_read_buffer_size = bytes;
        self
    }

    pub fn maximum_frame_size(mut self, bytes: usize) -> Self {
        self.maximum_frame_size = bytes;
        self
    }

    pub fn frame_size_hard_limit(mut self, bytes: usize) -> Self {
        self.frame_size_hard_limit = bytes;
        self
    }

    pub fn chunked_read_threshold(mut self, bytes: usize) -> Self {
        self.chunked_read_threshold = bytes;
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn tcp_keepalive(mut self, enabled: bool) -> Self {
        self.tcp_keepalive = enabled;
        self
    }

    pub fn tcp_reuse_addr(mut self, enabled: bool) -> Self {
        self.tcp_reuse_addr = enabled;
        self
    }

    pub fn outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    pub fn inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.inbound_queue_capacity = capacity;
        self
    }

    /// 校验并生成不可变的 [`Settings`]。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - `maximum-frame-size` < 32000 → `Configuration`；
    /// - `frame-size-hard-limit` 必须不小于 `maximum-frame-size` 且不超过 `u32::MAX - 4`；
    /// - 流缓冲、分块阈值、队列容量与建连超时必须为正；
    /// - 空的 `bind-hostname`/`public-hostname` 回退为 `hostname`，缺省 `bind-port` 回退为 `port`。
    pub fn build(self) -> Result<Settings> {
        let hostname = self.hostname.trim().to_string();
        if hostname.is_empty() {
            return Err(TransportError::configuration(
                "hostname",
                "must not be empty",
            ));
        }
        let public_hostname = non_empty_or(self.public_hostname, &hostname);
        let bind_hostname = non_empty_or(self.bind_hostname, &hostname);

        if self.maximum_frame_size < MINIMUM_MAXIMUM_FRAME_SIZE {
            return Err(TransportError::configuration(
                "maximum-frame-size",
                format!(
                    "must be at least {MINIMUM_MAXIMUM_FRAME_SIZE} bytes, got {}",
                    self.maximum_frame_size
                ),
            ));
        }
        if self.frame_size_hard_limit < self.maximum_frame_size {
            return Err(TransportError::configuration(
                "frame-size-hard-limit",
                format!(
                    "must not be smaller than maximum-frame-size ({}), got {}",
                    self.maximum_frame_size, self.frame_size_hard_limit
                ),
            ));
        }
        if self.frame_size_hard_limit > MAX_FRAME_SIZE_HARD_LIMIT {
            return Err(TransportError::configuration(
                "frame-size-hard-limit",
                "exceeds the range of the 4-byte length header",
            ));
        }
        ensure_positive("stream-write-buffer-size", self.stream_write_buffer_size)?;
        ensure_positive("stream-read-buffer-size", self.stream_read_buffer_size)?;
        ensure_positive("chunked-read-threshold", self.chunked_read_threshold)?;
        ensure_positive("outbound-queue-capacity", self.outbound_queue_capacity)?;
        ensure_positive("inbound-queue-capacity", self.inbound_queue_capacity)?;
        if self.connection_timeout.is_zero() {
            return Err(TransportError::configuration(
                "connection-timeout",
                "must be positive",
            ));
        }

        Ok(Settings {
            hostname,
            public_hostname,
            bind_hostname,
            port: self.port,
            bind_port: self.bind_port.unwrap_or(self.port),
            connection_timeout: self.connection_timeout,
            send_buffer_size: optional_size(self.send_buffer_size),
            receive_buffer_size: optional_size(self.receive_buffer_size),
            stream_write_buffer_size: self.stream_write_buffer_size,
            stream_read_buffer_size: self.stream_read_buffer_size,
            maximum_frame_size: self.maximum_frame_size,
            frame_size_hard_limit: self.frame_size_hard_limit,
            chunked_read_threshold: self.chunked_read_threshold,
            backlog: self.backlog,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive: self.tcp_keepalive,
            tcp_reuse_addr: self.tcp_reuse_addr,
            outbound_queue_capacity: self.outbound_queue_capacity,
            inbound_queue_capacity: self.inbound_queue_capacity,
        })
    }
}

fn non_empty_or(value: Option<String>, fallback: &str) -> String {
    match value {
        Some(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn optional_size(bytes: usize) -> Option<usize> {
    (bytes > 0).then_some(bytes)
}

fn ensure_positive(key: &'static str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(TransportError::configuration(key, "must be positive"));
    }
    Ok(())
}

/// TOML 文档的原始形态，所有键均可缺省。
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct SettingsDocument {
    hostname: Option<String>,
    public_hostname: Option<String>,
    bind_hostname: Option<String>,
    port: Option<u16>,
    bind_port: Option<u16>,
    connection_timeout_ms: Option<u64>,
    send_buffer_size: Option<u64>,
    receive_buffer_size: Option<u64>,
    stream_write_buffer_size: Option<u64>,
    stream_read_buffer_size: Option<u64>,
    maximum_frame_size: Option<u64>,
    frame_size_hard_limit: Option<u64>,
    chunked_read_threshold: Option<u64>,
    backlog: Option<u32>,
    tcp_nodelay: Option<bool>,
    tcp_keepalive: Option<bool>,
    tcp_reuse_addr: Option<bool>,
    outbound_queue_capacity: Option<u64>,
    inbound_queue_capacity: Option<u64>,
}

impl SettingsDocument {
    fn into_builder(self) -> Result<SettingsBuilder> {
        let mut builder = Settings::builder();
        if let Some(hostname) = self.hostname {
            builder = builder.hostname(hostname);
        }
        if let Some(hostname) = self.public_hostname {
            builder = builder.public_hostname(hostname);
        }
        if let Some(hostname) = self.bind_hostname {
            builder = builder.bind_hostname(hostname);
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        builder = builder.bind_port(self.bind_port);
        if let Some(millis) = self.connection_timeout_ms {
            builder = builder.connection_timeout(Duration::from_millis(millis));
        }
        if let Some(bytes) = self.send_buffer_size {
            builder = builder.send_buffer_size(to_usize("send-buffer-size", bytes)?);
        }
        if let Some(bytes) = self.receive_buffer_size {
            builder = builder.receive_buffer_size(to_usize("receive-buffer-size", bytes)?);
        }
        if let Some(bytes) = self.stream_write_buffer_size {
            builder =
                builder.stream_write_buffer_size(to_usize("stream-write-buffer-size", bytes)?);
        }
        if let Some(bytes) = self.stream_read_buffer_size {
            builder = builder.stream_read_buffer_size(to_usize("stream-read-buffer-size", bytes)?);
        }
        if let Some(bytes) = self.maximum_frame_size {
            builder = builder.maximum_frame_size(to_usize("maximum-frame-size", bytes)?);
        }
        if let Some(bytes) = self.frame_size_hard_limit {
            builder = builder.frame_size_hard_limit(to_usize("frame-size-hard-limit", bytes)?);
        }
        if let Some(bytes) = self.chunked_read_threshold {
            builder = builder.chunked_read_threshold(to_usize("chunked-read-threshold", bytes)?);
        }
        if let Some(backlog) = self.backlog {
            builder = builder.backlog(backlog);
        }
        if let Some(enabled) = self.tcp_nodelay {
            builder = builder.tcp_nodelay(enabled);
        }
        if let Some(enabled) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(enabled);
        }
        if let Some(enabled) = self.tcp_reuse_addr {
            builder = builder.tcp_reuse_addr(enabled);
        }
        if let Some(capacity) = self.outbound_queue_capacity {
            builder = builder.outbound_queue_capacity(to_usize("outbound-queue-capacity", capacity)?);
        }
        if let Some(capacity) = self.inbound_queue_capacity {
            builder = builder.inbound_queue_capacity(to_usize("inbound-queue-capacity", capacity)?);
        }
        Ok(builder)
    }
}

fn to_usize(key: &'static str, value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| TransportError::configuration(key, "does not fit the platform word size"))
}
