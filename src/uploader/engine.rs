// 上传引擎
//
// 单个传输（一个本地文件 -> 一个远端 Blob）的完整流程：
// 1. 预检：已取消、目标已存在、打开并映射源文件
// 2. 规划分片，选择上传方式（整体/块列表/页范围）
// 3. 页 Blob：先创建目标并设置层级
// 4. 把每个分片交给线程池，调度后立即处理下一个，不等待完成
// 5. 每个分片结束时报告完成，恰好一个分片观察到"最后一个"并执行收尾：
//    提交、设置层级、释放映射、失败时删除目标、报告传输结束
//
// 任何路径（成功、失败、取消）都必须恰好一次释放映射、恰好一次报告结束

use crate::blob::BlobDestination;
use crate::uploader::{
    BlobTypeHint, BlockListStrategy, ChunkDescriptor, ChunkOutcome, ChunkPlan, PageRangeStrategy,
    Pacer, PartTransferManager, SourceMapping, StrategyKind, TransferStatus, UploadError,
    UploadStrategy, WholeObjectStrategy, PAGE_BYTES,
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, Level};

/// 上传一个本地文件到目标 Blob
///
/// 预检失败（已取消、目标已存在、源文件无法打开）时直接结束传输并返回 Ok；
/// 只有内部一致性错误和调度器关闭返回 Err（此时传输同样已经结束）
///
/// # 参数
/// * `jptm` - 传输管理器
/// * `dest` - 目标端
/// * `pacer` - 限速器
pub async fn upload_local_to_blob(
    jptm: Arc<dyn PartTransferManager>,
    dest: Arc<dyn BlobDestination>,
    pacer: Arc<Pacer>,
) -> Result<(), UploadError> {
    match preflight(&*jptm, dest.as_ref()).await {
        Preflight::Proceed(mapping) => upload_mapped(jptm, dest, pacer, mapping).await,
        Preflight::Concluded => Ok(()),
    }
}

/// 预检结果
pub(crate) enum Preflight {
    /// 继续上传（大小为 0 的源没有映射）
    Proceed(Option<Arc<SourceMapping>>),
    /// 传输已结束并报告完成
    Concluded,
}

/// 预检：已取消、目标已存在、打开并映射源文件
pub(crate) async fn preflight(
    jptm: &dyn PartTransferManager,
    dest: &dyn BlobDestination,
) -> Preflight {
    let source_size = jptm.info().source_size;

    if jptm.was_cancelled() {
        jptm.log(Level::INFO, "传输开始前已取消");
        jptm.add_bytes_done(source_size);
        jptm.set_status(TransferStatus::Cancelled);
        jptm.report_transfer_done();
        return Preflight::Concluded;
    }

    if !jptm.info().force_overwrite {
        match dest.get_properties().await {
            Ok(props) => {
                jptm.log(
                    Level::WARN,
                    &format!("目标已存在且未允许覆盖 (size={})", props.content_length),
                );
                jptm.set_status(TransferStatus::BlobAlreadyExists);
                jptm.add_bytes_done(source_size);
                jptm.report_transfer_done();
                return Preflight::Concluded;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                // 探测失败不阻止上传，真正的写入会给出明确结果
                let (status, msg) = e.status_and_message();
                jptm.log(
                    Level::WARN,
                    &format!("检查目标是否存在失败，继续上传: status={}, {}", status, msg),
                );
            }
        }
    }

    match open_source(jptm) {
        Ok(mapping) => Preflight::Proceed(mapping),
        Err(e) => {
            log_upload_error(jptm, "打开源文件", &e);
            jptm.set_status(TransferStatus::Failed);
            jptm.add_bytes_done(source_size);
            jptm.report_transfer_done();
            Preflight::Concluded
        }
    }
}

/// 打开源文件，大小为 0 时只检查可读，不建立映射
fn open_source(jptm: &dyn PartTransferManager) -> Result<Option<Arc<SourceMapping>>, UploadError> {
    let info = jptm.info();
    if info.source_size == 0 {
        std::fs::File::open(&info.source).map_err(|e| UploadError::SourceOpen {
            path: info.source.clone(),
            source: e,
        })?;
        return Ok(None);
    }
    SourceMapping::open(&info.source, info.source_size).map(|m| Some(Arc::new(m)))
}

/// 使用已打开的源映射上传
///
/// 映射的所有权交给本传输，由收尾的那一个分片释放
pub async fn upload_mapped(
    jptm: Arc<dyn PartTransferManager>,
    dest: Arc<dyn BlobDestination>,
    pacer: Arc<Pacer>,
    mapping: Option<Arc<SourceMapping>>,
) -> Result<(), UploadError> {
    let info = jptm.info();
    if info.blob_type == BlobTypeHint::PageBlob && !info.is_page_blob_eligible() {
        jptm.log(
            Level::WARN,
            &format!(
                "源文件大小 {} 不是 {} 的整数倍，改用块 Blob 上传",
                info.source_size, PAGE_BYTES
            ),
        );
    }
    let plan = ChunkPlan::new(
        info.source_size,
        info.block_size,
        info.is_page_blob_eligible(),
    );

    let chunks = match plan.descriptors(&info.source_display()) {
        Ok(chunks) => chunks,
        Err(e) => {
            log_upload_error(&*jptm, "分片规划", &e);
            jptm.set_status(TransferStatus::Failed);
            jptm.add_bytes_done(info.source_size);
            if let Some(mapping) = &mapping {
                mapping.release();
            }
            jptm.report_transfer_done();
            return Err(e);
        }
    };

    let strategy: Box<dyn UploadStrategy> = match plan.kind {
        StrategyKind::WholeObject => Box::new(WholeObjectStrategy::new(dest)),
        StrategyKind::BlockList => Box::new(BlockListStrategy::new(dest, plan.chunk_count)),
        StrategyKind::PageRange => {
            if !prepare_page_blob(&*jptm, &dest, mapping.as_deref()).await {
                return Ok(());
            }
            Box::new(PageRangeStrategy::new(dest))
        }
    };

    // 整体上传是 N=1 的特例，不使用完成计数器
    let completion = if plan.kind == StrategyKind::WholeObject {
        CompletionMode::Single
    } else {
        jptm.set_number_of_chunks(plan.chunk_count);
        CompletionMode::Counted
    };

    let transfer = Arc::new(ChunkedTransfer {
        jptm,
        strategy,
        mapping,
        pacer,
        completion,
    });
    transfer.schedule_all(chunks).await
}

/// 创建页 Blob 并设置页层级
///
/// 失败时已完成传输收尾，返回 false
async fn prepare_page_blob(
    jptm: &dyn PartTransferManager,
    dest: &Arc<dyn BlobDestination>,
    mapping: Option<&SourceMapping>,
) -> bool {
    let size = jptm.info().source_size;
    let (headers, metadata) = jptm.destination_headers_and_metadata(mapping);

    if let Err(e) = dest.create_page_blob(size, &headers, &metadata).await {
        log_upload_error(jptm, "创建页 Blob", &UploadError::from(e));
        jptm.cancel();
        jptm.set_status(TransferStatus::Failed);
        jptm.add_bytes_done(size);
        if let Some(mapping) = mapping {
            mapping.release();
        }
        jptm.report_transfer_done();
        return false;
    }

    if let Some(tier) = jptm.tier_settings().page_blob {
        if let Err(e) = dest.set_tier(tier).await {
            log_upload_error(jptm, &format!("设置页 Blob 层级 {}", tier), &UploadError::from(e));
            jptm.cancel();
            jptm.set_status(TransferStatus::TierSetFailure);
            jptm.add_bytes_done(size);
            if let Some(mapping) = mapping {
                mapping.release();
            }
            delete_destination(jptm, dest.as_ref()).await;
            jptm.report_transfer_done();
            return false;
        }
    }

    debug!("页 Blob 已创建: size={}, dst={}", size, dest.url());
    true
}

// =====================================================
// 分片任务
// =====================================================

/// 完成判定方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionMode {
    /// 只有一个分片，它就是最后一个
    Single,
    /// 通过管理器的完成计数器判定
    Counted,
}

/// 一个传输的所有分片任务共享的状态
struct ChunkedTransfer {
    jptm: Arc<dyn PartTransferManager>,
    strategy: Box<dyn UploadStrategy>,
    mapping: Option<Arc<SourceMapping>>,
    pacer: Arc<Pacer>,
    completion: CompletionMode,
}

impl ChunkedTransfer {
    /// 依次调度所有分片
    async fn schedule_all(self: Arc<Self>, chunks: Vec<ChunkDescriptor>) -> Result<(), UploadError> {
        let total = chunks.len();
        let mut pending = chunks.into_iter();

        while let Some(chunk) = pending.next() {
            let unit = self.clone().run_chunk(chunk).boxed();
            if let Err(e) = self.jptm.schedule_chunk(unit).await {
                log_upload_error(&*self.jptm, &format!("[分片#{}] 调度", chunk.index), &e);
                self.jptm.cancel();
                self.jptm.set_status(TransferStatus::Failed);

                // 未能调度的分片就地按取消处理，保证完成计数能够到达总数
                self.clone().run_chunk(chunk).await;
                for chunk in pending {
                    self.clone().run_chunk(chunk).await;
                }
                return Err(e);
            }
        }

        debug!(
            "{:?} 已调度 {} 个分片: {}",
            self.strategy.kind(),
            total,
            self.jptm.info().source_display()
        );
        Ok(())
    }

    /// 单个分片任务
    async fn run_chunk(self: Arc<Self>, chunk: ChunkDescriptor) {
        let jptm = &*self.jptm;
        let mut written = false;

        if jptm.was_cancelled() {
            debug!("[分片#{}] 传输已取消，跳过", chunk.index);
        } else {
            let upload = self.strategy.upload_chunk(
                jptm,
                &chunk,
                self.mapping.as_deref(),
                &self.pacer,
            );
            match AssertUnwindSafe(upload).catch_unwind().await {
                Ok(Ok(ChunkOutcome::Written)) => {
                    written = true;
                    debug!(
                        "[分片#{}] 上传完成: offset={}, len={}",
                        chunk.index, chunk.offset, chunk.length
                    );
                }
                Ok(Ok(ChunkOutcome::Skipped)) => {}
                Ok(Err(e)) => self.chunk_failed(&chunk, &e),
                Err(_) => {
                    jptm.cancel();
                    jptm.set_status(TransferStatus::Failed);
                    jptm.log(
                        Level::ERROR,
                        &format!("[分片#{}] 上传任务 panic", chunk.index),
                    );
                }
            }
        }

        // 无论成功、失败还是跳过，每个分片恰好统计一次
        jptm.add_bytes_done(chunk.length);
        self.chunk_done(written).await;
    }

    fn chunk_failed(&self, chunk: &ChunkDescriptor, err: &UploadError) {
        let jptm = &*self.jptm;
        if jptm.was_cancelled() {
            // 传输已被其他分片或上层取消，本分片的错误只是连带结果
            let (status, msg) = err.status_and_message();
            debug!(
                "[分片#{}] 取消后的上传错误: status={}, {}",
                chunk.index, status, msg
            );
            return;
        }

        jptm.cancel();
        log_upload_error(
            jptm,
            &format!("[分片#{}] 上传 (offset={})", chunk.index, chunk.offset),
            err,
        );
        jptm.set_status(TransferStatus::Failed);
    }

    async fn chunk_done(&self, written: bool) {
        let is_last = match self.completion {
            CompletionMode::Single => true,
            CompletionMode::Counted => self.jptm.report_chunk_done(),
        };
        if is_last {
            self.conclude(written).await;
        }
    }

    /// 收尾，只由最后一个分片执行
    ///
    /// `last_written` 表示执行收尾的分片自身是否写入成功
    async fn conclude(&self, last_written: bool) {
        let jptm = &*self.jptm;

        // 整体上传的唯一一次写入已经成功时，目标已存在，按正常流程结束
        let object_landed = self.completion == CompletionMode::Single && last_written;

        if jptm.was_cancelled() && !object_landed {
            jptm.set_status(TransferStatus::Cancelled);
            debug!(
                "传输已取消，跳过提交: status={:?}, {}",
                jptm.status(),
                jptm.info().source_display()
            );
        } else {
            match self.strategy.commit(jptm, self.mapping.as_deref()).await {
                Err(e) => {
                    log_upload_error(jptm, "提交", &e);
                    jptm.set_status(TransferStatus::Failed);
                }
                Ok(()) => {
                    if self.strategy.kind() == StrategyKind::BlockList {
                        info!("块列表已提交: {}", jptm.info().destination);
                    }
                    if let Some(tier) = self.strategy.post_commit_tier(&jptm.tier_settings()) {
                        if let Err(e) = self.strategy.destination().set_tier(tier).await {
                            log_upload_error(jptm, &format!("设置层级 {}", tier), &UploadError::from(e));
                            jptm.set_status(TransferStatus::TierSetFailure);
                        }
                    }
                    jptm.set_status(TransferStatus::Success);
                }
            }
        }

        let status = jptm.status();
        let cleanup = status.is_failure() && self.strategy.cleanup_required(status);
        self.finish(cleanup).await;
    }

    /// 释放映射，必要时删除目标，报告传输结束
    async fn finish(&self, cleanup: bool) {
        if let Some(mapping) = &self.mapping {
            mapping.release();
        }
        if cleanup {
            delete_destination(&*self.jptm, self.strategy.destination().as_ref()).await;
        }
        self.jptm.report_transfer_done();
    }
}

/// 尽力删除目标（清理未提交的块或不完整的对象）
///
/// 目标不存在视为正常结果
async fn delete_destination(jptm: &dyn PartTransferManager, dest: &dyn BlobDestination) {
    match dest.delete().await {
        Ok(()) => debug!("已删除不完整的目标: {}", dest.url()),
        Err(e) if e.is_not_found() => {
            debug!("清理时目标不存在: {}", dest.url());
        }
        Err(e) => {
            let (status, msg) = e.status_and_message();
            jptm.log(
                Level::ERROR,
                &format!("删除不完整的目标失败: status={}, {}", status, msg),
            );
        }
    }
}

/// 记录上传错误，带上源和目标
fn log_upload_error(jptm: &dyn PartTransferManager, what: &str, err: &UploadError) {
    let (status, msg) = err.status_and_message();
    if err.is_internal_fault() {
        error!("内部一致性错误: {}", err);
    }
    if status == 0 {
        jptm.log(Level::ERROR, &format!("{}失败: {}", what, msg));
    } else {
        jptm.log(Level::ERROR, &format!("{}失败: status={}, {}", what, status, msg));
    }
}
