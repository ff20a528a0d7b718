// 上传引擎模块
//
// 单个传输的分片上传：
// - 分片规划（整体 / 块列表 / 页范围）
// - 固定线程池 + 有界队列调度分片
// - 原子计数判定最后一个分片，由它执行唯一一次收尾
// - 源文件内存映射，恰好释放一次
// - 失败或取消时尽力删除不完整的目标

pub mod chunk;
pub mod completion;
pub mod engine;
pub mod error;
pub mod manager;
pub mod pacer;
pub mod scheduler;
pub mod source;
pub mod strategy;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;

pub use chunk::{
    page_chunk_size, ChunkDescriptor, ChunkPlan, StrategyKind, DEFAULT_BLOCK_SIZE,
    DEFAULT_PAGE_CHUNK_SIZE, PAGE_BYTES,
};
pub use completion::{BlockIdTable, CompletionCounter};
pub use engine::{upload_local_to_blob, upload_mapped};
pub use error::UploadError;
pub use manager::{guess_content_type, JobPartTransfer, PartTransferManager};
pub use pacer::{PacedBody, Pacer};
pub use scheduler::{ChunkFunc, ChunkWorkerPool};
pub use source::{is_all_zero, SourceMapping, SourceRange};
pub use strategy::{
    new_block_id, BlockListStrategy, ChunkOutcome, PageRangeStrategy, UploadStrategy,
    WholeObjectStrategy,
};
pub use task::{BlobTypeHint, TransferInfo, TransferStatus};
