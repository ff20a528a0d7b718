//! 上传引擎错误类型

use crate::blob::RemoteError;
use std::path::PathBuf;

/// 上传引擎错误
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("无法打开源文件 {path:?}: {source}")]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("源文件内存映射失败 {path:?}: {reason}")]
    SourceMap { path: PathBuf, reason: String },

    #[error("源文件映射不可用（未映射或已释放）")]
    SourceUnavailable,

    #[error("读取范围越界: offset={offset}, len={len}, 源大小={size}")]
    RangeOutOfBounds { offset: u64, len: u64, size: u64 },

    /// 计划分片数与实际生成的分片数不一致，属于程序缺陷
    #[error("计划分片数 {planned} 与实际分片数 {scheduled} 不一致 (src={source_path}, size={size})")]
    ChunkCountMismatch {
        planned: usize,
        scheduled: usize,
        source_path: String,
        size: u64,
    },

    #[error("块 ID 槽位 #{0} 被重复写入")]
    BlockIdConflict(usize),

    #[error("块 ID 槽位 #{0} 为空，无法提交块列表")]
    MissingBlockId(usize),

    #[error("分片调度器已关闭")]
    SchedulerClosed,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl UploadError {
    /// 转换为 (状态码, 消息)，非远端错误的状态码为 0
    pub fn status_and_message(&self) -> (u16, String) {
        match self {
            UploadError::Remote(e) => e.status_and_message(),
            other => (0, other.to_string()),
        }
    }

    /// 是否为内部一致性错误（不可重试，需要上层中止）
    pub fn is_internal_fault(&self) -> bool {
        matches!(
            self,
            UploadError::ChunkCountMismatch { .. }
                | UploadError::BlockIdConflict(_)
                | UploadError::MissingBlockId(_)
        )
    }
}
