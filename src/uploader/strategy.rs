// 上传方式
//
// 分片任务的外壳（取消检查、字节统计、完成计数、收尾）对所有上传方式相同，
// 各方式只负责单个分片的远端写入和收尾时的提交：
// - 整体上传：一次 Put Blob，无提交
// - 块列表：暂存块，收尾时按序提交块列表
// - 页范围：跳过全零分片，无提交（页 Blob 创建时已有完整大小）

use crate::blob::{AccessTier, BlobDestination, TierSettings};
use crate::uploader::{
    is_all_zero, BlockIdTable, ChunkDescriptor, PacedBody, Pacer, PartTransferManager,
    SourceMapping, StrategyKind, TransferStatus, UploadError,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use tracing::debug;

/// 单个分片的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 已写入远端
    Written,
    /// 无需写入（全零页）
    Skipped,
}

/// 上传方式
#[async_trait]
pub trait UploadStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// 目标端
    fn destination(&self) -> &Arc<dyn BlobDestination>;

    /// 上传单个分片
    async fn upload_chunk(
        &self,
        jptm: &dyn PartTransferManager,
        chunk: &ChunkDescriptor,
        mapping: Option<&SourceMapping>,
        pacer: &Arc<Pacer>,
    ) -> Result<ChunkOutcome, UploadError>;

    /// 收尾提交（所有分片完成且传输未取消时调用一次）
    async fn commit(
        &self,
        jptm: &dyn PartTransferManager,
        mapping: Option<&SourceMapping>,
    ) -> Result<(), UploadError>;

    /// 提交成功后要设置的层级
    fn post_commit_tier(&self, tiers: &TierSettings) -> Option<AccessTier>;

    /// 以 status 结束时是否需要删除目标
    fn cleanup_required(&self, status: TransferStatus) -> bool;
}

/// 把分片对应的源字节包装成限速请求体
fn chunk_body(
    chunk: &ChunkDescriptor,
    mapping: Option<&SourceMapping>,
    pacer: &Arc<Pacer>,
) -> Result<PacedBody, UploadError> {
    let mapping = mapping.ok_or(UploadError::SourceUnavailable)?;
    let range = mapping.range(chunk.offset, chunk.length)?;
    Ok(PacedBody::new(chunk.offset, range, pacer.clone()))
}

/// 生成新的块 ID
///
/// UUID v4 字符串的 base64，同一 Blob 内所有块 ID 长度一致
pub fn new_block_id() -> String {
    STANDARD.encode(uuid::Uuid::new_v4().to_string())
}

// =====================================================
// 整体上传
// =====================================================

pub struct WholeObjectStrategy {
    dest: Arc<dyn BlobDestination>,
}

impl WholeObjectStrategy {
    pub fn new(dest: Arc<dyn BlobDestination>) -> Self {
        Self { dest }
    }
}

#[async_trait]
impl UploadStrategy for WholeObjectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::WholeObject
    }

    fn destination(&self) -> &Arc<dyn BlobDestination> {
        &self.dest
    }

    async fn upload_chunk(
        &self,
        jptm: &dyn PartTransferManager,
        chunk: &ChunkDescriptor,
        mapping: Option<&SourceMapping>,
        pacer: &Arc<Pacer>,
    ) -> Result<ChunkOutcome, UploadError> {
        let body = if chunk.length == 0 {
            PacedBody::empty(pacer.clone())
        } else {
            chunk_body(chunk, mapping, pacer)?
        };

        let (headers, metadata) = jptm.destination_headers_and_metadata(mapping);
        self.dest
            .upload_whole_object(body, &headers, &metadata)
            .await?;
        Ok(ChunkOutcome::Written)
    }

    async fn commit(
        &self,
        _jptm: &dyn PartTransferManager,
        _mapping: Option<&SourceMapping>,
    ) -> Result<(), UploadError> {
        Ok(())
    }

    fn post_commit_tier(&self, tiers: &TierSettings) -> Option<AccessTier> {
        tiers.block_blob
    }

    fn cleanup_required(&self, status: TransferStatus) -> bool {
        // 写入失败时目标不存在，只有层级设置失败需要删除
        status == TransferStatus::TierSetFailure
    }
}

// =====================================================
// 块列表
// =====================================================

pub struct BlockListStrategy {
    dest: Arc<dyn BlobDestination>,
    block_ids: BlockIdTable,
}

impl BlockListStrategy {
    /// # 参数
    /// * `dest` - 目标端
    /// * `chunk_count` - 分片数（块 ID 表大小）
    pub fn new(dest: Arc<dyn BlobDestination>, chunk_count: usize) -> Self {
        Self {
            dest,
            block_ids: BlockIdTable::new(chunk_count),
        }
    }

    pub fn block_ids(&self) -> &BlockIdTable {
        &self.block_ids
    }
}

#[async_trait]
impl UploadStrategy for BlockListStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlockList
    }

    fn destination(&self) -> &Arc<dyn BlobDestination> {
        &self.dest
    }

    async fn upload_chunk(
        &self,
        _jptm: &dyn PartTransferManager,
        chunk: &ChunkDescriptor,
        mapping: Option<&SourceMapping>,
        pacer: &Arc<Pacer>,
    ) -> Result<ChunkOutcome, UploadError> {
        let block_id = new_block_id();
        self.block_ids.set(chunk.index, block_id.clone())?;

        let body = chunk_body(chunk, mapping, pacer)?;
        self.dest.stage_block(&block_id, body).await?;
        debug!("[分片#{}] 块已暂存: id={}", chunk.index, block_id);
        Ok(ChunkOutcome::Written)
    }

    async fn commit(
        &self,
        jptm: &dyn PartTransferManager,
        mapping: Option<&SourceMapping>,
    ) -> Result<(), UploadError> {
        let block_ids = self.block_ids.collect()?;
        let (headers, metadata) = jptm.destination_headers_and_metadata(mapping);
        self.dest
            .commit_block_list(&block_ids, &headers, &metadata)
            .await?;
        Ok(())
    }

    fn post_commit_tier(&self, tiers: &TierSettings) -> Option<AccessTier> {
        tiers.block_blob
    }

    fn cleanup_required(&self, _status: TransferStatus) -> bool {
        true
    }
}

// =====================================================
// 页范围
// =====================================================

pub struct PageRangeStrategy {
    dest: Arc<dyn BlobDestination>,
}

impl PageRangeStrategy {
    /// 目标页 Blob 必须已经创建
    pub fn new(dest: Arc<dyn BlobDestination>) -> Self {
        Self { dest }
    }
}

#[async_trait]
impl UploadStrategy for PageRangeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PageRange
    }

    fn destination(&self) -> &Arc<dyn BlobDestination> {
        &self.dest
    }

    async fn upload_chunk(
        &self,
        _jptm: &dyn PartTransferManager,
        chunk: &ChunkDescriptor,
        mapping: Option<&SourceMapping>,
        pacer: &Arc<Pacer>,
    ) -> Result<ChunkOutcome, UploadError> {
        let mapping = mapping.ok_or(UploadError::SourceUnavailable)?;
        let range = mapping.range(chunk.offset, chunk.length)?;

        // 未写入的页读出来就是零
        if is_all_zero(&range) {
            debug!(
                "[分片#{}] 全零页，跳过写入: offset={}, len={}",
                chunk.index, chunk.offset, chunk.length
            );
            return Ok(ChunkOutcome::Skipped);
        }

        let body = PacedBody::new(chunk.offset, range, pacer.clone());
        self.dest.upload_page_range(chunk.offset, body).await?;
        Ok(ChunkOutcome::Written)
    }

    async fn commit(
        &self,
        _jptm: &dyn PartTransferManager,
        _mapping: Option<&SourceMapping>,
    ) -> Result<(), UploadError> {
        Ok(())
    }

    fn post_commit_tier(&self, _tiers: &TierSettings) -> Option<AccessTier> {
        // 页 Blob 的层级在创建后立即设置
        None
    }

    fn cleanup_required(&self, _status: TransferStatus) -> bool {
        true
    }
}
