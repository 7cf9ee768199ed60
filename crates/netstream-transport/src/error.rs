use std::{borrow::Cow, io, time::Duration};
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const BIND: OperationKind = OperationKind {
    code: "netstream.tcp.bind_failed",
    message: "tcp bind",
};
pub const RESOLVE: OperationKind = OperationKind {
    code: "netstream.tcp.resolve_failed",
    message: "tcp resolve",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "netstream.tcp.accept_failed",
    message: "tcp accept",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "netstream.tcp.connect_failed",
    message: "tcp connect",
};
pub const HANDSHAKE: OperationKind = OperationKind {
    code: "netstream.tcp.handshake_failed",
    message: "tcp handshake",
};
pub const READ: OperationKind = OperationKind {
    code: "netstream.tcp.read_failed",
    message: "tcp read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "netstream.tcp.write_failed",
    message: "tcp write",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "netstream.tcp.configure_failed",
    message: "tcp configure",
};

const CANCEL_CODE: &str = "netstream.tcp.cancelled";
const TIMEOUT_CODE: &str = "netstream.tcp.timeout";

/// 错误分类，供宿主框架选择重试/退避/告警策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 可在建议的等待时间后重试。
    Retryable(Duration),
    /// 重试无意义，应直接上报。
    NonRetryable,
    /// 截止时间到期。
    Timeout,
    /// 操作被主动取消或连接已被关闭。
    Cancelled,
    /// 启动期配置错误，传输不会绑定。
    Configuration,
    /// 对端字节流违反分帧协议。
    Protocol,
}

/// 建连失败的具体种类。
///
/// 宿主的重连/退避策略对“超时”与“被拒绝/不可达”截然不同，因此保留为独立枚举。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Timeout,
    Refused,
    Unreachable,
    Other,
}

/// 传输层统一错误类型。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“配置错误 / 建连失败 / 帧违规 / I/O 故障 / 取消超时”五类失败收敛到一个枚举，
///   调用方仅凭 [`TransportError::category`] 即可决定处理策略；
/// - 每个变体都有稳定错误码（[`TransportError::code`]），日志与告警按码聚合。
///
/// ## 契约 (What)
/// - `Cancelled`/`Timeout` 表示“本次尝试已放弃”，绝不会与成功的空结果混淆；
/// - `ConnectionClosed` 表示在已关闭的连接上发起 I/O，`ConnectionClosing` 表示关联正在
///   关闭时提交的发送；
/// - `FrameTooLarge` 只由解码路径产生，出现后所属连接必然已被关闭。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid setting `{key}`: {reason}")]
    Configuration {
        key: &'static str,
        reason: Cow<'static, str>,
    },

    #[error("connect to {remote} failed ({kind:?}): {detail}")]
    Connect {
        remote: String,
        kind: ConnectErrorKind,
        detail: String,
    },

    #[error("declared frame length {declared} exceeds hard limit {limit}")]
    FrameTooLarge { declared: u64, limit: usize },

    #[error("payload length {len} exceeds maximum frame size {limit}")]
    PayloadTooLarge { len: usize, limit: usize },

    #[error("{}: {source}", .op.message)]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection closing")]
    ConnectionClosing,

    #[error("association faulted: {detail}")]
    Faulted { detail: String },

    #[error("{} cancelled", .op.message)]
    Cancelled { op: OperationKind },

    #[error("{} timed out", .op.message)]
    Timeout { op: OperationKind },

    #[error("listener stopped accepting: {detail}")]
    ListenerClosed { detail: String },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// crate 内统一的结果别名。
pub type Result<T, E = TransportError> = std::result::Result<T, E>;

impl TransportError {
    pub(crate) fn configuration(key: &'static str, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Configuration {
            key,
            reason: reason.into(),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "netstream.config.invalid",
            Self::Connect { .. } => CONNECT.code,
            Self::FrameTooLarge { .. } => "netstream.frame.hard_limit_exceeded",
            Self::PayloadTooLarge { .. } => "netstream.frame.payload_too_large",
            Self::Io { op, .. } => op.code,
            Self::ConnectionClosed => "netstream.tcp.closed",
            Self::ConnectionClosing => "netstream.association.closing",
            Self::Faulted { .. } => "netstream.association.faulted",
            Self::Cancelled { .. } => CANCEL_CODE,
            Self::Timeout { .. } => TIMEOUT_CODE,
            Self::ListenerClosed { .. } => "netstream.listener.closed",
            Self::InvalidState(_) => "netstream.state.invalid",
        }
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Connect { kind, .. } => match kind {
                ConnectErrorKind::Timeout => ErrorCategory::Timeout,
                ConnectErrorKind::Refused | ConnectErrorKind::Unreachable => {
                    ErrorCategory::Retryable(Duration::from_millis(500))
                }
                ConnectErrorKind::Other => ErrorCategory::NonRetryable,
            },
            Self::FrameTooLarge { .. } => ErrorCategory::Protocol,
            Self::PayloadTooLarge { .. } => ErrorCategory::NonRetryable,
            Self::Io { source, .. } => categorize_io_error(source),
            Self::ConnectionClosed | Self::ConnectionClosing | Self::Cancelled { .. } => {
                ErrorCategory::Cancelled
            }
            Self::Faulted { .. } | Self::ListenerClosed { .. } | Self::InvalidState(_) => {
                ErrorCategory::NonRetryable
            }
            Self::Timeout { .. } => ErrorCategory::Timeout,
        }
    }

    /// 是否为“尝试已放弃”（取消或超时）结果。
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Timeout { .. })
    }

    /// 若为建连失败，返回其种类。
    pub fn connect_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            Self::Connect { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// 将 IO 错误映射为传输错误。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    TransportError::Io {
        op: kind,
        source: error,
    }
}

/// 构造取消错误。
pub(crate) fn cancelled_error(kind: OperationKind) -> TransportError {
    TransportError::Cancelled { op: kind }
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> TransportError {
    TransportError::Timeout { op: kind }
}

/// 将建连阶段的 IO 错误归类为 [`ConnectErrorKind`]。
pub(crate) fn classify_connect_error(error: &io::Error) -> ConnectErrorKind {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
        ErrorKind::TimedOut => ConnectErrorKind::Timeout,
        ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::AddrNotAvailable
        | ErrorKind::NetworkDown => ConnectErrorKind::Unreachable,
        _ => ConnectErrorKind::Other,
    }
}

#[cfg(target_os = "linux")]
const TRANSIENT_ACCEPT_ERRNOS: &[i32] = &[12, 23, 24, 105];
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
const TRANSIENT_ACCEPT_ERRNOS: &[i32] = &[12, 23, 24, 55];
#[cfg(windows)]
const TRANSIENT_ACCEPT_ERRNOS: &[i32] = &[10024, 10055];
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    windows
)))]
const TRANSIENT_ACCEPT_ERRNOS: &[i32] = &[];

/// 判断 `accept` 失败是否只是暂时性的资源耗尽或握手前被对端放弃。
///
/// - 文件描述符耗尽（EMFILE/ENFILE）、内核缓冲不足（ENOBUFS/ENOMEM）会在连接释放后自行恢复；
/// - 其余错误视为监听套接字本身失效。
pub(crate) fn is_transient_accept_error(error: &io::Error) -> bool {
    use io::ErrorKind;
    if matches!(
        error.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::OutOfMemory
    ) {
        return true;
    }
    error
        .raw_os_error()
        .is_some_and(|code| TRANSIENT_ACCEPT_ERRNOS.contains(&code))
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorCategory::Retryable(Duration::from_millis(5))
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => ErrorCategory::Retryable(Duration::from_millis(50)),
        ErrorKind::WriteZero => ErrorCategory::Retryable(Duration::from_millis(10)),
        _ => ErrorCategory::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_are_classified_by_kind() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        let unreachable = io::Error::from(io::ErrorKind::HostUnreachable);
        assert_eq!(classify_connect_error(&refused), ConnectErrorKind::Refused);
        assert_eq!(classify_connect_error(&timed_out), ConnectErrorKind::Timeout);
        assert_eq!(
            classify_connect_error(&unreachable),
            ConnectErrorKind::Unreachable
        );
    }

    #[test]
    fn abandoned_outcomes_are_distinct_from_io_failures() {
        assert!(cancelled_error(READ).is_abandoned());
        assert!(timeout_error(CONNECT).is_abandoned());
        let io = map_io_error(WRITE, io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!io.is_abandoned());
        assert_eq!(io.code(), WRITE.code);
        assert_eq!(io.to_string(), "tcp write: broken pipe");
    }

    #[test]
    fn descriptor_exhaustion_is_transient_for_accept() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert!(is_transient_accept_error(&aborted));
        let invalid = io::Error::from(io::ErrorKind::InvalidInput);
        assert!(!is_transient_accept_error(&invalid));
        #[cfg(target_os = "linux")]
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(24)));
    }
}
