//! # telemetry 模块说明
//!
//! ## 角色定位（Why）
//! - 传输内部只通过 `tracing` 宏打点，是否输出、输出到哪由宿主决定；
//! - 对于没有自建 Subscriber 的宿主（示例程序、集成测试、运维工具），提供一键安装入口。
//!
//! ## 契约（What）
//! - [`install`] 组装 `fmt + EnvFilter`，`RUST_LOG` 缺省时使用 `info`；
//! - 进程内只能成功安装一次；外部已设置全局 Subscriber 时返回错误而不是覆盖它。

use std::sync::OnceLock;
use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// 日志安装失败的原因。
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("netstream telemetry is already installed")]
    AlreadyInstalled,
    #[error("a global tracing subscriber has already been set")]
    SubscriberAlreadySet,
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] dispatcher::SetGlobalDefaultError),
}

/// 安装全局 `tracing` Subscriber。
///
/// # 教案式说明
/// - **逻辑（How）**：先检查本模块与外部是否已安装，再以 `registry + EnvFilter + fmt` 组装并设为全局默认；
/// - **契约（What）**：重复调用返回 [`TelemetryError::AlreadyInstalled`]；宿主已有 Subscriber 时返回
///   [`TelemetryError::SubscriberAlreadySet`]。
pub fn install() -> Result<(), TelemetryError> {
    if INSTALLED.get().is_some() {
        return Err(TelemetryError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)?;
    INSTALLED
        .set(())
        .map_err(|_| TelemetryError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
