// Blob Upload Engine
// 本地文件到对象存储 Blob 的分片上传引擎

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// Blob 目标端模块
pub mod blob;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use blob::{AccessTier, BlobDestination, RemoteError, RestBlobClient};
pub use config::{AppConfig, LogConfig, UploadConfig};
pub use uploader::{
    upload_local_to_blob, ChunkWorkerPool, JobPartTransfer, Pacer, PartTransferManager,
    TransferInfo, TransferStatus, UploadError,
};
