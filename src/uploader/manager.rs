// 传输管理器
//
// PartTransferManager 是上传引擎依赖的外部协作方契约：
// 传输信息、取消、状态、字节统计、分片完成计数、分片调度、
// 目标端内容头推断和日志。
//
// JobPartTransfer 是进程内的实现，供命令行和测试使用

use crate::blob::{BlobHttpHeaders, Metadata, TierSettings};
use crate::uploader::{
    ChunkFunc, ChunkWorkerPool, CompletionCounter, SourceMapping, TransferInfo, TransferStatus,
    UploadError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

/// 内容嗅探读取的最大字节数
const SNIFF_BYTES: u64 = 512;

/// 无法识别时的默认内容类型
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// 单个传输的管理器契约
#[async_trait]
pub trait PartTransferManager: Send + Sync {
    /// 传输信息（只读快照）
    fn info(&self) -> &TransferInfo;

    fn was_cancelled(&self) -> bool;

    /// 取消整个传输，尚未开始的分片会观察到并跳过
    fn cancel(&self);

    /// 传输级取消令牌
    fn context(&self) -> CancellationToken;

    /// 设置状态（失败类状态不会被覆盖）
    fn set_status(&self, status: TransferStatus);

    fn status(&self) -> TransferStatus;

    /// 累加已完成字节数，返回累加后的值
    fn add_bytes_done(&self, n: u64) -> u64;

    /// 设置分片总数，必须在调度第一个分片之前调用
    fn set_number_of_chunks(&self, n: usize);

    /// 报告一个分片完成，恰好一个调用者得到 true
    fn report_chunk_done(&self) -> bool;

    /// 报告传输结束
    fn report_transfer_done(&self);

    /// 把分片任务交给线程池
    async fn schedule_chunk(&self, unit: ChunkFunc) -> Result<(), UploadError>;

    /// 计算目标端内容头和元数据
    fn destination_headers_and_metadata(
        &self,
        mapping: Option<&SourceMapping>,
    ) -> (BlobHttpHeaders, Metadata);

    fn tier_settings(&self) -> TierSettings;

    /// 带传输上下文的日志
    fn log(&self, level: Level, message: &str) {
        let info = self.info();
        let src = info.source_display();
        let dst = info.destination.as_str();
        match level {
            Level::ERROR => error!("{} (src={}, dst={})", message, src, dst),
            Level::WARN => warn!("{} (src={}, dst={})", message, src, dst),
            Level::INFO => info!("{} (src={}, dst={})", message, src, dst),
            _ => debug!("{} (src={}, dst={})", message, src, dst),
        }
    }
}

// =====================================================
// 进程内实现
// =====================================================

/// 进程内的传输管理器
#[derive(Debug)]
pub struct JobPartTransfer {
    info: TransferInfo,
    cancel_token: CancellationToken,
    status: Mutex<TransferStatus>,
    bytes_done: AtomicU64,
    completion: CompletionCounter,
    pool: ChunkWorkerPool,
    /// 传输结束信号
    done_tx: watch::Sender<bool>,
    /// report_transfer_done 调用次数
    done_reports: AtomicUsize,
}

impl JobPartTransfer {
    /// 创建传输管理器
    ///
    /// # 参数
    /// * `info` - 传输信息
    /// * `pool` - 分片上传线程池（可与其他传输共享）
    pub fn new(info: TransferInfo, pool: ChunkWorkerPool) -> Self {
        Self::with_cancel_token(info, pool, CancellationToken::new())
    }

    /// 使用外部取消令牌创建（上层取消作业时级联取消本传输）
    pub fn with_cancel_token(
        info: TransferInfo,
        pool: ChunkWorkerPool,
        cancel_token: CancellationToken,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            info,
            cancel_token,
            status: Mutex::new(TransferStatus::InProgress),
            bytes_done: AtomicU64::new(0),
            completion: CompletionCounter::new(1),
            pool,
            done_tx,
            done_reports: AtomicUsize::new(0),
        }
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::SeqCst)
    }

    /// report_transfer_done 被调用的次数
    pub fn done_reports(&self) -> usize {
        self.done_reports.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// 等待传输结束，返回最终状态
    pub async fn wait_done(&self) -> TransferStatus {
        let mut rx = self.done_tx.subscribe();
        // 发送端由 self 持有，等待期间不会关闭
        let _ = rx.wait_for(|done| *done).await;
        self.status()
    }
}

#[async_trait]
impl PartTransferManager for JobPartTransfer {
    fn info(&self) -> &TransferInfo {
        &self.info
    }

    fn was_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    fn cancel(&self) {
        if !self.cancel_token.is_cancelled() {
            debug!("传输已取消: {}", self.info.source_display());
        }
        self.cancel_token.cancel();
    }

    fn context(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    fn set_status(&self, status: TransferStatus) {
        let mut current = self.status.lock();
        if *current == status {
            return;
        }
        if current.can_transition_to(status) {
            debug!(
                "传输状态变更: {:?} -> {:?} ({})",
                *current,
                status,
                self.info.source_display()
            );
            *current = status;
        } else {
            debug!(
                "忽略状态变更: {:?} -> {:?}（保留先前状态）",
                *current, status
            );
        }
    }

    fn status(&self) -> TransferStatus {
        *self.status.lock()
    }

    fn add_bytes_done(&self, n: u64) -> u64 {
        self.bytes_done.fetch_add(n, Ordering::SeqCst) + n
    }

    fn set_number_of_chunks(&self, n: usize) {
        self.completion.set_total(n);
    }

    fn report_chunk_done(&self) -> bool {
        self.completion.report_chunk_done()
    }

    fn report_transfer_done(&self) {
        let reports = self.done_reports.fetch_add(1, Ordering::SeqCst) + 1;
        if reports > 1 {
            error!(
                "传输结束被重复报告 (第 {} 次): {}",
                reports,
                self.info.source_display()
            );
            return;
        }

        info!(
            "传输结束: status={:?}, bytes={}, src={}, dst={}",
            self.status(),
            self.bytes_done(),
            self.info.source_display(),
            self.info.destination
        );
        self.done_tx.send_replace(true);
    }

    async fn schedule_chunk(&self, unit: ChunkFunc) -> Result<(), UploadError> {
        self.pool.schedule(unit).await
    }

    fn destination_headers_and_metadata(
        &self,
        mapping: Option<&SourceMapping>,
    ) -> (BlobHttpHeaders, Metadata) {
        let mut headers = self.info.headers.clone();
        if headers.content_type.is_none() {
            let head = mapping.and_then(|m| m.head(SNIFF_BYTES));
            headers.content_type = Some(guess_content_type(
                &self.info.source,
                head.as_deref(),
            ));
        }
        (headers, self.info.metadata.clone())
    }

    fn tier_settings(&self) -> TierSettings {
        self.info.tiers
    }
}

// =====================================================
// 内容类型推断
// =====================================================

/// 推断内容类型
///
/// 先按扩展名查表，查不到时嗅探文件头部
pub fn guess_content_type(path: &std::path::Path, head: Option<&[u8]>) -> String {
    let by_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(|e| content_type_by_extension(&e.to_ascii_lowercase()));
    if let Some(content_type) = by_ext {
        return content_type.to_string();
    }

    match head {
        Some(bytes) if !bytes.is_empty() && looks_like_text(bytes) => {
            "text/plain; charset=utf-8".to_string()
        }
        _ => DEFAULT_CONTENT_TYPE.to_string(),
    }
}

fn content_type_by_extension(ext: &str) -> Option<&'static str> {
    let content_type = match ext {
        "txt" | "log" => "text/plain",
        "htm" | "html" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "wasm" => "application/wasm",
        "vhd" => DEFAULT_CONTENT_TYPE,
        _ => return None,
    };
    Some(content_type)
}

fn looks_like_text(bytes: &[u8]) -> bool {
    if bytes.contains(&0) {
        return false;
    }
    match std::str::from_utf8(bytes) {
        Ok(_) => true,
        // 截断在多字节字符中间
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::AccessTier;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn transfer(info: TransferInfo) -> JobPartTransfer {
        JobPartTransfer::new(info, ChunkWorkerPool::new(2, 4))
    }

    #[tokio::test]
    async fn test_status_is_monotone() {
        let jptm = transfer(TransferInfo::new("/a.bin", "https://x/y", 10, 4));
        assert_eq!(jptm.status(), TransferStatus::InProgress);

        jptm.set_status(TransferStatus::Failed);
        jptm.set_status(TransferStatus::Success);
        jptm.set_status(TransferStatus::Cancelled);
        assert_eq!(jptm.status(), TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_bytes_and_chunks() {
        let jptm = transfer(TransferInfo::new("/a.bin", "https://x/y", 10, 4));
        assert_eq!(jptm.add_bytes_done(4), 4);
        assert_eq!(jptm.add_bytes_done(6), 10);

        jptm.set_number_of_chunks(2);
        assert!(!jptm.report_chunk_done());
        assert!(jptm.report_chunk_done());
    }

    #[tokio::test]
    async fn test_wait_done() {
        let jptm = Arc::new(transfer(TransferInfo::new("/a.bin", "https://x/y", 0, 4)));
        assert!(!jptm.is_done());

        let waiter = {
            let jptm = jptm.clone();
            tokio::spawn(async move { jptm.wait_done().await })
        };

        jptm.set_status(TransferStatus::Success);
        jptm.report_transfer_done();
        jptm.report_transfer_done();

        let status = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, TransferStatus::Success);
        assert_eq!(jptm.done_reports(), 2);
    }

    #[tokio::test]
    async fn test_cancel_is_shared_with_context() {
        let parent = CancellationToken::new();
        let jptm = JobPartTransfer::with_cancel_token(
            TransferInfo::new("/a.bin", "https://x/y", 10, 4),
            ChunkWorkerPool::new(1, 1),
            parent.child_token(),
        );
        let ctx = jptm.context();
        assert!(!jptm.was_cancelled());

        parent.cancel();
        assert!(jptm.was_cancelled());
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_headers_and_tiers() {
        let mut info = TransferInfo::new("/data/readme", "https://x/y", 11, 4).with_tiers(
            TierSettings {
                block_blob: Some(AccessTier::Cool),
                page_blob: None,
            },
        );
        info.metadata.insert("owner".to_string(), "ops".to_string());
        let jptm = transfer(info);

        let mapping = SourceMapping::from_vec("/data/readme", b"hello world".to_vec());
        let (headers, metadata) = jptm.destination_headers_and_metadata(Some(&mapping));
        assert_eq!(
            headers.content_type.as_deref(),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(metadata.get("owner").map(String::as_str), Some("ops"));
        assert_eq!(jptm.tier_settings().block_blob, Some(AccessTier::Cool));
        mapping.release();

        // 显式指定的内容类型优先
        let mut info = TransferInfo::new("/data/a.json", "https://x/y", 2, 4);
        info.headers.content_type = Some("application/x-custom".to_string());
        let jptm = transfer(info);
        let (headers, _) = jptm.destination_headers_and_metadata(None);
        assert_eq!(headers.content_type.as_deref(), Some("application/x-custom"));
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type(Path::new("a.JSON"), None), "application/json");
        assert_eq!(guess_content_type(Path::new("a.png"), Some(b"abc")), "image/png");
        assert_eq!(
            guess_content_type(Path::new("noext"), Some(b"plain text")),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            guess_content_type(Path::new("noext"), Some(&[0u8, 1, 2, 3])),
            DEFAULT_CONTENT_TYPE
        );
        assert_eq!(guess_content_type(Path::new("noext"), None), DEFAULT_CONTENT_TYPE);

        // 多字节字符在嗅探边界被截断
        let text = "上传引擎".as_bytes();
        assert_eq!(
            guess_content_type(Path::new("noext"), Some(&text[..text.len() - 1])),
            "text/plain; charset=utf-8"
        );
    }
}
