use crate::{
    context::CallContext,
    error::{OperationKind, Result, cancelled_error, map_io_error, timeout_error},
};
use std::{future::Future, io};

/// 让任意操作与上下文的取消信号、截止时间竞速。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 每个阻塞的网络操作都必须“完成、超时或取消”三选一，绝不无限挂起；
/// - 调用方在超时/取消后立刻被释放，而不必等待底层系统调用返回。
///
/// ## 逻辑 (How)
/// - 进入前先检查取消与截止，已触发时直接返回，不轮询 `future`；
/// - 使用 `tokio::select!`（`biased`，取消优先）组合取消、截止与操作本身；
/// - 任一分支胜出后，其余分支（包括被放弃的 `future` 及其等待登记）随栈帧一起释放。
///
/// ## 契约 (What)
/// - 返回 [`TransportError::Cancelled`](crate::TransportError::Cancelled) 或
///   [`TransportError::Timeout`](crate::TransportError::Timeout) 表示本次尝试已放弃；
/// - **后置条件**：被放弃的操作不保证在内核层面被中断，持有资源的组件须随后关闭该资源，
///   防止迟到的副作用。
pub async fn with_context<F, T>(ctx: &CallContext, kind: OperationKind, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if ctx.cancellation().is_cancelled() {
        return Err(cancelled_error(kind));
    }
    if ctx.deadline().is_expired() {
        return Err(timeout_error(kind));
    }

    let cancel = ctx.cancellation().cancelled();
    tokio::pin!(cancel);
    tokio::pin!(future);

    if let Some(deadline) = ctx.deadline().instant() {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = &mut cancel => Err(cancelled_error(kind)),
            _ = &mut sleep => Err(timeout_error(kind)),
            result = &mut future => result,
        }
    } else {
        tokio::select! {
            biased;
            _ = &mut cancel => Err(cancelled_error(kind)),
            result = &mut future => result,
        }
    }
}

/// 在保留取消/超时语义的前提下执行 IO Future，并把 IO 错误映射为传输错误。
pub(crate) async fn run_with_context<F, T>(
    ctx: &CallContext,
    kind: OperationKind,
    future: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    with_context(ctx, kind, async move {
        future.await.map_err(|err| map_io_error(kind, err))
    })
    .await
}
