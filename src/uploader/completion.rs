// 分片完成计数与块 ID 表
//
// 所有分片任务并发报告完成，恰好一个任务观察到"最后一个"并负责收尾。
// 块 ID 表按分片序号划分槽位，每个槽位只由对应的分片写入一次，
// 提交时按序号顺序读出

use crate::uploader::UploadError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use tracing::error;

// =====================================================
// 完成计数器
// =====================================================

/// 分片完成计数器
#[derive(Debug, Default)]
pub struct CompletionCounter {
    /// 期望的分片总数（调度前设置）
    total: AtomicUsize,
    /// 已完成的分片数
    done: AtomicUsize,
}

impl CompletionCounter {
    pub fn new(total: usize) -> Self {
        Self {
            total: AtomicUsize::new(total),
            done: AtomicUsize::new(0),
        }
    }

    /// 设置分片总数，必须在第一个分片调度之前调用
    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Release);
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Acquire)
    }

    /// 报告一个分片完成
    ///
    /// 只有使计数恰好达到总数的那一次调用返回 true
    pub fn report_chunk_done(&self) -> bool {
        let total = self.total();
        let done = self.done.fetch_add(1, Ordering::AcqRel) + 1;
        if done > total {
            error!("分片完成次数超过总数: done={}, total={}", done, total);
            return false;
        }
        done == total
    }
}

// =====================================================
// 块 ID 表
// =====================================================

/// 块 ID 表
///
/// 槽位 i 只由分片 i 写入，写入无需加锁
#[derive(Debug)]
pub struct BlockIdTable {
    slots: Vec<OnceLock<String>>,
}

impl BlockIdTable {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 写入分片 index 的块 ID
    pub fn set(&self, index: usize, block_id: String) -> Result<(), UploadError> {
        let slot = self
            .slots
            .get(index)
            .ok_or(UploadError::BlockIdConflict(index))?;
        slot.set(block_id)
            .map_err(|_| UploadError::BlockIdConflict(index))
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.slots.get(index).and_then(|s| s.get()).map(|s| s.as_str())
    }

    /// 按序号顺序取出全部块 ID
    ///
    /// 任何槽位为空都返回错误（提交前所有分片必须已完成）
    pub fn collect(&self) -> Result<Vec<String>, UploadError> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| slot.get().cloned().ok_or(UploadError::MissingBlockId(i)))
            .collect()
    }
}
