// 上传分片规划
//
// 根据源文件大小、配置的分片大小和目标类型决定上传方式：
// - 文件为空或 <= 分片大小：整体上传（不分片，无需提交块列表）
// - 页 Blob：分片大小限制在 4MB 以内并按 512 字节对齐，逐页范围写入
// - 其他：按分片大小切块，暂存后提交块列表
//
// 最后一个分片长度为 S - offset，可能小于分片大小

use crate::uploader::UploadError;
use std::ops::Range;
use tracing::{debug, error, info};

/// 页 Blob 的页大小: 512 字节
pub const PAGE_BYTES: u64 = 512;

/// 页 Blob 单次写入上限: 4MB
pub const DEFAULT_PAGE_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 默认块大小: 8MB
pub const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024;

/// 上传方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// 整体上传（Put Blob）
    WholeObject,
    /// 暂存块 + 提交块列表
    BlockList,
    /// 页范围写入（跳过全零页）
    PageRange,
}

/// 分片描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 分片序号 0..N-1
    pub index: usize,
    /// 源文件中的偏移
    pub offset: u64,
    /// 分片长度
    pub length: u64,
}

impl ChunkDescriptor {
    pub fn new(index: usize, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
        }
    }

    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// 分片计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    /// 上传方式
    pub kind: StrategyKind,
    /// 源文件大小
    pub source_size: u64,
    /// 实际使用的分片大小
    pub chunk_size: u64,
    /// 计划的分片数
    pub chunk_count: usize,
}

impl ChunkPlan {
    /// 生成分片计划
    ///
    /// # 参数
    /// * `source_size` - 源文件大小
    /// * `block_size` - 配置的分片大小（0 表示使用默认值）
    /// * `page_eligible` - 是否以页 Blob 方式上传
    pub fn new(source_size: u64, block_size: u64, page_eligible: bool) -> Self {
        let block_size = if block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            block_size
        };

        let plan = if source_size == 0 || source_size <= block_size {
            Self {
                kind: StrategyKind::WholeObject,
                source_size,
                chunk_size: source_size,
                chunk_count: 1,
            }
        } else if page_eligible {
            let chunk_size = page_chunk_size(block_size);
            Self {
                kind: StrategyKind::PageRange,
                source_size,
                chunk_size,
                chunk_count: source_size.div_ceil(chunk_size) as usize,
            }
        } else {
            Self {
                kind: StrategyKind::BlockList,
                source_size,
                chunk_size: block_size,
                chunk_count: source_size.div_ceil(block_size) as usize,
            }
        };

        info!(
            "分片计划: 方式={:?}, 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            plan.kind, plan.source_size, plan.chunk_size, plan.chunk_count
        );
        plan
    }

    /// 按顺序生成分片描述
    pub fn chunks(&self) -> ChunkIter {
        ChunkIter {
            source_size: self.source_size,
            chunk_size: self.chunk_size,
            whole: self.kind == StrategyKind::WholeObject,
            offset: 0,
            index: 0,
        }
    }

    /// 生成全部分片描述，并校验数量与计划一致
    ///
    /// 数量不一致属于内部一致性错误，调用方必须中止传输
    pub fn descriptors(&self, source_path: &str) -> Result<Vec<ChunkDescriptor>, UploadError> {
        let chunks: Vec<ChunkDescriptor> = self.chunks().collect();
        if chunks.len() != self.chunk_count {
            error!(
                "分片数量校验失败: 计划={}, 实际={}, src={}, size={}",
                self.chunk_count,
                chunks.len(),
                source_path,
                self.source_size
            );
            return Err(UploadError::ChunkCountMismatch {
                planned: self.chunk_count,
                scheduled: chunks.len(),
                source_path: source_path.to_string(),
                size: self.source_size,
            });
        }
        debug!("分片描述生成完成: {} 个", chunks.len());
        Ok(chunks)
    }
}

/// 页 Blob 分片大小：不超过 4MB，向下对齐到 512 字节（至少一页）
pub fn page_chunk_size(block_size: u64) -> u64 {
    let clamped = block_size.min(DEFAULT_PAGE_CHUNK_SIZE);
    let aligned = clamped - clamped % PAGE_BYTES;
    aligned.max(PAGE_BYTES)
}

/// 分片迭代器
#[derive(Debug, Clone)]
pub struct ChunkIter {
    source_size: u64,
    chunk_size: u64,
    /// 整体上传时恰好产出一个（可能为空的）分片
    whole: bool,
    offset: u64,
    index: usize,
}

impl Iterator for ChunkIter {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.whole {
            if self.index > 0 {
                return None;
            }
            self.index = 1;
            return Some(ChunkDescriptor::new(0, 0, self.source_size));
        }

        debug_assert!(self.chunk_size > 0, "分片大小为 0");
        if self.offset >= self.source_size {
            return None;
        }

        let length = self.chunk_size.min(self.source_size - self.offset);
        let chunk = ChunkDescriptor::new(self.index, self.offset, length);
        self.offset += length;
        self.index += 1;
        Some(chunk)
    }
}
