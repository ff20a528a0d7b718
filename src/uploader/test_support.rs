// 测试用的内存目标端
//
// 记录每一次远端调用，并可按需注入失败

use crate::blob::{
    AccessTier, BlobDestination, BlobHttpHeaders, BlobProperties, Metadata, RemoteError,
};
use crate::uploader::engine::{preflight, Preflight};
use crate::uploader::{
    upload_mapped, ChunkWorkerPool, JobPartTransfer, PacedBody, Pacer, SourceMapping,
    TransferInfo, TransferStatus,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const MB: u64 = 1024 * 1024;

/// 记录的远端调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetProperties,
    UploadWhole { len: u64 },
    StageBlock { id: String, len: u64 },
    CommitBlockList { ids: Vec<String> },
    CreatePageBlob { size: u64 },
    UploadPages { offset: u64, len: u64 },
    SetTier(AccessTier),
    Delete,
}

#[derive(Default)]
struct Recorded {
    calls: Vec<Call>,
    whole: Vec<u8>,
    blocks: HashMap<String, Vec<u8>>,
    committed: Vec<String>,
    content_type: Option<String>,
}

/// 内存目标端
#[derive(Default)]
pub struct RecordingDestination {
    recorded: Mutex<Recorded>,
    exists: bool,
    probe_error: Option<RemoteError>,
    fail_stage_offset: Option<u64>,
    fail_whole: bool,
    fail_create_page: bool,
    fail_page_offset: Option<u64>,
    fail_commit: bool,
    fail_set_tier: bool,
    delete_not_found: bool,
    cancel_on_stage: Option<CancellationToken>,
    cancel_on_whole: Option<CancellationToken>,
}

impl RecordingDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// 目标已存在
    pub fn existing(mut self) -> Self {
        self.exists = true;
        self
    }

    /// 存在性检查返回指定错误
    pub fn probe_error(mut self, err: RemoteError) -> Self {
        self.probe_error = Some(err);
        self
    }

    /// 暂存偏移为 offset 的块时失败
    pub fn fail_stage_at_offset(mut self, offset: u64) -> Self {
        self.fail_stage_offset = Some(offset);
        self
    }

    /// 整体上传失败
    pub fn fail_whole_upload(mut self) -> Self {
        self.fail_whole = true;
        self
    }

    pub fn fail_create_page_blob(mut self) -> Self {
        self.fail_create_page = true;
        self
    }

    /// 写入偏移为 offset 的页范围时失败
    pub fn fail_pages_at_offset(mut self, offset: u64) -> Self {
        self.fail_page_offset = Some(offset);
        self
    }

    pub fn fail_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn fail_set_tier(mut self) -> Self {
        self.fail_set_tier = true;
        self
    }

    /// 删除时返回 404
    pub fn delete_not_found(mut self) -> Self {
        self.delete_not_found = true;
        self
    }

    /// 第一次暂存块时取消给定令牌
    pub fn cancel_on_first_stage(mut self, token: CancellationToken) -> Self {
        self.cancel_on_stage = Some(token);
        self
    }

    /// 整体上传进行中取消给定令牌，上传本身仍然成功
    pub fn cancel_during_whole_upload(mut self, token: CancellationToken) -> Self {
        self.cancel_on_whole = Some(token);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.recorded.lock().calls.clone()
    }

    /// 除存在性检查和层级设置外的调用
    pub fn write_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::GetProperties | Call::SetTier(_)))
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.recorded.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// 整体上传的内容
    pub fn uploaded_bytes(&self) -> Vec<u8> {
        self.recorded.lock().whole.clone()
    }

    /// 按提交顺序拼接的块内容
    pub fn committed_bytes(&self) -> Vec<u8> {
        let recorded = self.recorded.lock();
        recorded
            .committed
            .iter()
            .flat_map(|id| recorded.blocks.get(id).cloned().unwrap_or_default())
            .collect()
    }

    pub fn content_type(&self) -> Option<String> {
        self.recorded.lock().content_type.clone()
    }

    fn record(&self, call: Call) {
        self.recorded.lock().calls.push(call);
    }
}

fn injected(message: &str) -> RemoteError {
    RemoteError::new(500, Some("InternalError".to_string()), message)
}

#[async_trait]
impl BlobDestination for RecordingDestination {
    fn url(&self) -> &str {
        "https://account.blob.core.windows.net/container/blob"
    }

    async fn get_properties(&self) -> Result<BlobProperties, RemoteError> {
        self.record(Call::GetProperties);
        if let Some(err) = &self.probe_error {
            return Err(err.clone());
        }
        if self.exists {
            Ok(BlobProperties {
                content_length: 1,
                blob_type: Some("BlockBlob".to_string()),
                etag: None,
            })
        } else {
            Err(RemoteError::not_found("blob does not exist"))
        }
    }

    async fn upload_whole_object(
        &self,
        body: PacedBody,
        headers: &BlobHttpHeaders,
        _metadata: &Metadata,
    ) -> Result<(), RemoteError> {
        let len = body.len();
        self.record(Call::UploadWhole { len });
        if let Some(token) = &self.cancel_on_whole {
            token.cancel();
        }
        if self.fail_whole {
            return Err(injected("put blob failed"));
        }

        let bytes = body.read_all().await;
        let mut recorded = self.recorded.lock();
        recorded.whole = bytes;
        recorded.content_type = headers.content_type.clone();
        Ok(())
    }

    async fn stage_block(&self, block_id: &str, body: PacedBody) -> Result<(), RemoteError> {
        let offset = body.offset();
        let len = body.len();
        self.record(Call::StageBlock {
            id: block_id.to_string(),
            len,
        });

        if let Some(token) = &self.cancel_on_stage {
            token.cancel();
        }
        if self.fail_stage_offset == Some(offset) {
            // 让其他分片有机会先开始
            tokio::time::sleep(Duration::from_millis(10)).await;
            return Err(injected("stage block failed"));
        }

        let bytes = body.read_all().await;
        self.recorded
            .lock()
            .blocks
            .insert(block_id.to_string(), bytes);
        Ok(())
    }

    async fn commit_block_list(
        &self,
        block_ids: &[String],
        headers: &BlobHttpHeaders,
        _metadata: &Metadata,
    ) -> Result<(), RemoteError> {
        let mut recorded = self.recorded.lock();
        recorded.calls.push(Call::CommitBlockList {
            ids: block_ids.to_vec(),
        });
        if self.fail_commit {
            return Err(injected("commit failed"));
        }
        recorded.committed = block_ids.to_vec();
        recorded.content_type = headers.content_type.clone();
        Ok(())
    }

    async fn create_page_blob(
        &self,
        size: u64,
        _headers: &BlobHttpHeaders,
        _metadata: &Metadata,
    ) -> Result<(), RemoteError> {
        self.record(Call::CreatePageBlob { size });
        if self.fail_create_page {
            return Err(injected("create page blob failed"));
        }
        Ok(())
    }

    async fn upload_page_range(&self, offset: u64, body: PacedBody) -> Result<(), RemoteError> {
        self.record(Call::UploadPages {
            offset,
            len: body.len(),
        });
        if self.fail_page_offset == Some(offset) {
            return Err(injected("put page failed"));
        }
        Ok(())
    }

    async fn set_tier(&self, tier: AccessTier) -> Result<(), RemoteError> {
        self.record(Call::SetTier(tier));
        if self.fail_set_tier {
            return Err(RemoteError::new(409, None, "tier not supported"));
        }
        Ok(())
    }

    async fn delete(&self) -> Result<(), RemoteError> {
        self.record(Call::Delete);
        if self.delete_not_found {
            return Err(RemoteError::not_found("blob does not exist"));
        }
        Ok(())
    }
}

/// 在临时目录中写入源文件
pub fn write_source(name: &str, data: &[u8]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    (dir, path)
}

/// 完整执行一次传输并等待结束
///
/// 与 `upload_local_to_blob` 走同样的预检，但保留源映射的句柄，
/// 传输结束后检查映射恰好释放一次
pub async fn run_transfer(
    info: TransferInfo,
    dest: Arc<RecordingDestination>,
) -> (Arc<JobPartTransfer>, TransferStatus) {
    let pool = ChunkWorkerPool::new(4, 16);
    let jptm = Arc::new(JobPartTransfer::new(info, pool.clone()));

    let mapping = match preflight(&*jptm, dest.as_ref()).await {
        Preflight::Proceed(mapping) => {
            upload_mapped(
                jptm.clone(),
                dest,
                Arc::new(Pacer::unlimited()),
                mapping.clone(),
            )
            .await
            .unwrap();
            mapping
        }
        Preflight::Concluded => None,
    };
    let status = tokio::time::timeout(Duration::from_secs(30), jptm.wait_done())
        .await
        .unwrap();

    pool.shutdown().await;
    assert_released_once(mapping.as_deref());
    (jptm, status)
}

/// 映射存在时必须恰好释放一次
pub fn assert_released_once(mapping: Option<&SourceMapping>) {
    if let Some(mapping) = mapping {
        assert!(mapping.is_released());
        assert_eq!(mapping.release_count(), 1);
    }
}
