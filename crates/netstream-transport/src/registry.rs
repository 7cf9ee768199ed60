//! # AssociationRegistry：存活关联登记表
//!
//! ## 核心意图（Why）
//! - 传输关闭时需要找到并关闭所有仍存活的关联，监听器与发起器都向这里登记；
//! - 基于 `DashMap` 分片存储，接受循环与建连调用并发登记时不会争用同一把锁。
//!
//! ## 行为契约（What）
//! - `track`：登记句柄，并在关联终止后自动移除；
//! - `snapshot`：复制当前所有句柄，供关闭流程逐个关闭；
//! - `remove`：关闭流程确认关联终止后立即移除，不等待后台任务；
//! - 以 [`AssociationId`] 为索引，同一关联不会重复登记。
//!
//! ## 风险提示（Trade-offs）
//! - 自动移除依赖一个等待 `closed()` 的轻量任务，每条关联一个，随关联终止而结束。

use crate::association::{AssociationHandle, AssociationId};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct AssociationRegistry {
    associations: DashMap<AssociationId, AssociationHandle>,
}

impl AssociationRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 登记关联，终止后自动移除。
    pub(crate) fn track(self: &Arc<Self>, handle: &AssociationHandle) {
        let id = handle.id();
        self.associations.insert(id, handle.clone());
        let registry = Arc::clone(self);
        let watched = handle.clone();
        tokio::spawn(async move {
            watched.closed().await;
            registry.associations.remove(&id);
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<AssociationHandle> {
        self.associations
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn remove(&self, id: AssociationId) {
        self.associations.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.associations.len()
    }
}
