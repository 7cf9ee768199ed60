//! # codec 模块说明
//!
//! ## 角色定位（Why）
//! - 定义线上唯一的字节格式：`[u32 大端长度][payload]`，除此之外不附加任何字节；
//! - 纯函数式实现，只读写 [`BytesMut`]，不触碰套接字，便于属性测试覆盖。
//!
//! ## 交互契约（What）
//! - `decode` 的三种结果：`Ok(Some(frame))` 产出一帧，`Ok(None)` 表示字节不足，
//!   `Err(FrameTooLarge)` 表示声明长度越过硬上限，所属连接必须关闭；
//! - `read_hint` 给出下一次套接字读取的建议字节数，泵据此决定整帧读取还是分块读取。

use crate::{
    error::{Result, TransportError},
    settings::Settings,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 长度字段的字节数。
pub const LENGTH_FIELD_LEN: usize = 4;

/// 硬上限的可取最大值：帧长（长度字段 + 载荷）必须仍能用 `u32` 表示，
/// 32 位平台上 `LENGTH_FIELD_LEN + declared` 因此不会溢出。
pub const MAX_FRAME_SIZE_HARD_LIMIT: usize = u32::MAX as usize - LENGTH_FIELD_LEN;

/// 解码得到的一帧。
///
/// 长度超过 `maximum-frame-size` 但未超过硬上限的帧仍会交付，
/// 由 [`Frame::exceeds_maximum_frame_size`] 标记，是否拒收交给上层决定。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
    oversized: bool,
}

impl Frame {
    pub(crate) fn new(payload: Bytes, oversized: bool) -> Self {
        Self { payload, oversized }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// 声明长度是否超过了 `maximum-frame-size`。
    pub fn exceeds_maximum_frame_size(&self) -> bool {
        self.oversized
    }
}

/// 长度前缀分帧编解码器。
///
/// # 设计动机（Why）
/// - 把“帧边界”与“字节到达节奏”解耦：TCP 可能把一帧拆成任意多段，也可能把多帧粘在一起；
/// - 在读取载荷之前就校验声明长度，恶意或损坏的长度字段不会诱发超大内存分配。
///
/// # 行为概览（How）
/// - `encode`：写入 4 字节大端长度，再写入载荷；
/// - `decode`：先窥视长度字段而不消费，待载荷完整后一次性切出 `Bytes`，零拷贝交付；
/// - `read_hint`：小帧（低于分块阈值）一次请求剩余全部字节，大帧按读缓冲大小分块。
///
/// # 契约说明（What）
/// - **前置条件**：`maximum_frame_size <= hard_limit <= MAX_FRAME_SIZE_HARD_LIMIT`，由 [`Settings`] 校验保证，
///   `with_limits` 也会钳制超出的硬上限；
/// - **后置条件**：`decode` 返回 `Ok(None)` 时不消费任何字节；返回错误后缓冲内容不再有意义。
///
/// # 权衡与风险（Trade-offs）
/// - 编解码器无状态，每次解码都重新读取长度字段；4 字节窥视的成本可以忽略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameCodec {
    maximum_frame_size: usize,
    hard_limit: usize,
    chunked_read_threshold: usize,
    read_chunk: usize,
}

impl FrameCodec {
    /// 依据配置构造编解码器。
    pub fn new(settings: &Settings) -> Self {
        Self::with_limits(
            settings.maximum_frame_size(),
            settings.frame_size_hard_limit(),
            settings.chunked_read_threshold(),
            settings.stream_read_buffer_size(),
        )
    }

    /// 直接指定各项上限；`read_chunk` 为 0 时按 1 处理。
    pub fn with_limits(
        maximum_frame_size: usize,
        hard_limit: usize,
        chunked_read_threshold: usize,
        read_chunk: usize,
    ) -> Self {
        Self {
            maximum_frame_size,
            hard_limit: hard_limit.min(MAX_FRAME_SIZE_HARD_LIMIT),
            chunked_read_threshold,
            read_chunk: read_chunk.max(1),
        }
    }

    pub fn maximum_frame_size(&self) -> usize {
        self.maximum_frame_size
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }

    /// 为给定载荷长度生成长度字段。
    pub fn encode_header(&self, len: usize) -> Result<[u8; LENGTH_FIELD_LEN]> {
        if len > self.hard_limit {
            return Err(TransportError::FrameTooLarge {
                declared: len as u64,
                limit: self.hard_limit,
            });
        }
        // hard_limit 已被钳制在 u32 范围内。
        let len = u32::try_from(len).map_err(|_| TransportError::FrameTooLarge {
            declared: len as u64,
            limit: self.hard_limit,
        })?;
        Ok(len.to_be_bytes())
    }

    /// 把一帧追加写入 `dst`。
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        let header = self.encode_header(payload.len())?;
        dst.reserve(LENGTH_FIELD_LEN + payload.len());
        dst.put_slice(&header);
        dst.put_slice(payload);
        Ok(())
    }

    /// 尝试从 `src` 头部切出一帧。
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(declared) = peek_length(src) else {
            return Ok(None);
        };
        if declared > self.hard_limit as u64 {
            return Err(TransportError::FrameTooLarge {
                declared,
                limit: self.hard_limit,
            });
        }
        // declared <= hard_limit <= MAX_FRAME_SIZE_HARD_LIMIT，转换与加法都不会溢出。
        let len = declared as usize;
        if src.len() < LENGTH_FIELD_LEN + len {
            return Ok(None);
        }
        src.advance(LENGTH_FIELD_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame::new(payload, len > self.maximum_frame_size)))
    }

    /// 计算下一次套接字读取应请求的字节数。
    ///
    /// # 教案级注释
    ///
    /// ## 意图（Why）
    /// - 小帧一次读满，减少系统调用；大帧分块读，避免为单帧申请与声明长度等大的读缓冲。
    ///
    /// ## 契约（What）
    /// - 长度字段尚未完整：返回一个读块，顺带读入后续字节；
    /// - 当前帧声明长度低于分块阈值：返回 `max(剩余字节, 读块)`，一次读完整帧；
    /// - 达到或超过阈值：返回 `min(剩余字节, 读块)`；
    /// - 当前帧已完整（或声明长度越界）：返回一个读块，由 `decode` 负责后续处理；
    /// - 返回值恒大于 0。
    pub fn read_hint(&self, buffered: &BytesMut) -> usize {
        let Some(declared) = peek_length(buffered) else {
            return self.read_chunk;
        };
        if declared > self.hard_limit as u64 {
            return self.read_chunk;
        }
        let total = LENGTH_FIELD_LEN + declared as usize;
        let pending = total.saturating_sub(buffered.len());
        if pending == 0 {
            return self.read_chunk;
        }
        if (declared as usize) < self.chunked_read_threshold {
            pending.max(self.read_chunk)
        } else {
            pending.min(self.read_chunk)
        }
    }
}

fn peek_length(src: &BytesMut) -> Option<u64> {
    let header: [u8; LENGTH_FIELD_LEN] = src.get(..LENGTH_FIELD_LEN)?.try_into().ok()?;
    Some(u64::from(u32::from_be_bytes(header)))
}
