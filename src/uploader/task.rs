// 传输任务定义
//
// TransferInfo 是单个传输（一个本地文件 -> 一个远端 Blob）的只读快照，
// 创建后由该传输的所有分片任务共享

use crate::blob::{BlobHttpHeaders, Metadata, TierSettings};
use crate::uploader::chunk::PAGE_BYTES;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 传输状态
///
/// 一旦进入失败类状态就不会再被覆盖（见 `can_transition_to`），
/// Success 只在收尾阶段所有远端调用成功后设置
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// 进行中
    InProgress,
    /// 成功
    Success,
    /// 失败
    Failed,
    /// 目标已存在且未允许覆盖
    BlobAlreadyExists,
    /// 设置访问层级失败
    TierSetFailure,
    /// 已取消
    Cancelled,
}

impl TransferStatus {
    /// 是否为失败类状态
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TransferStatus::Failed
                | TransferStatus::BlobAlreadyExists
                | TransferStatus::TierSetFailure
                | TransferStatus::Cancelled
        )
    }

    /// 状态迁移规则
    ///
    /// - 失败类状态不可再被覆盖（保留第一个失败原因）
    /// - 不能回到 InProgress
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        if self.is_failure() || next == TransferStatus::InProgress {
            return false;
        }
        true
    }
}

/// 目标类型提示
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlobTypeHint {
    /// 根据扩展名和大小判断（.vhd 且大小为 512 的整数倍时使用页 Blob）
    #[default]
    Detect,
    /// 强制块 Blob
    BlockBlob,
    /// 页 Blob（大小不是 512 的整数倍时退回块 Blob）
    PageBlob,
}

/// 传输信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInfo {
    /// 本地源文件路径
    pub source: PathBuf,
    /// 目标 Blob 地址
    pub destination: String,
    /// 源文件大小
    pub source_size: u64,
    /// 配置的分片大小
    pub block_size: u64,
    /// 目标已存在时是否覆盖
    #[serde(default)]
    pub force_overwrite: bool,
    /// 目标类型提示
    #[serde(default)]
    pub blob_type: BlobTypeHint,
    /// 显式指定的内容头（未指定的字段由引擎推断）
    #[serde(default)]
    pub headers: BlobHttpHeaders,
    /// 用户元数据
    #[serde(default)]
    pub metadata: Metadata,
    /// 提交后要设置的访问层级
    #[serde(default)]
    pub tiers: TierSettings,
}

impl TransferInfo {
    /// 创建新的传输信息
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<String>,
        source_size: u64,
        block_size: u64,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            source_size,
            block_size,
            force_overwrite: false,
            blob_type: BlobTypeHint::Detect,
            headers: BlobHttpHeaders::default(),
            metadata: Metadata::new(),
            tiers: TierSettings::default(),
        }
    }

    pub fn with_force_overwrite(mut self, force: bool) -> Self {
        self.force_overwrite = force;
        self
    }

    pub fn with_blob_type(mut self, blob_type: BlobTypeHint) -> Self {
        self.blob_type = blob_type;
        self
    }

    pub fn with_tiers(mut self, tiers: TierSettings) -> Self {
        self.tiers = tiers;
        self
    }

    /// 是否以页 Blob 方式上传
    pub fn is_page_blob_eligible(&self) -> bool {
        if self.source_size % PAGE_BYTES != 0 {
            return false;
        }
        match self.blob_type {
            BlobTypeHint::BlockBlob => false,
            BlobTypeHint::PageBlob => true,
            BlobTypeHint::Detect => self.source_has_extension("vhd"),
        }
    }

    fn source_has_extension(&self, ext: &str) -> bool {
        self.source
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(ext))
            .unwrap_or(false)
    }

    /// 日志用的源路径
    pub fn source_display(&self) -> String {
        self.source.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_statuses() {
        assert!(!TransferStatus::InProgress.is_failure());
        assert!(!TransferStatus::Success.is_failure());
        assert!(TransferStatus::Failed.is_failure());
        assert!(TransferStatus::BlobAlreadyExists.is_failure());
        assert!(TransferStatus::TierSetFailure.is_failure());
        assert!(TransferStatus::Cancelled.is_failure());
    }

    #[test]
    fn test_status_transitions() {
        use TransferStatus::*;

        assert!(InProgress.can_transition_to(Success));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Success.can_transition_to(TierSetFailure));

        // 失败后不可回到成功
        assert!(!Failed.can_transition_to(Success));
        assert!(!TierSetFailure.can_transition_to(Success));
        // 保留第一个失败原因
        assert!(!Failed.can_transition_to(Cancelled));
        assert!(!Success.can_transition_to(InProgress));
    }

    #[test]
    fn test_page_blob_detection() {
        let info = TransferInfo::new("/data/disk.VHD", "https://a/b", 1024 * 512, 4096);
        assert!(info.is_page_blob_eligible());

        // 大小不是 512 的整数倍
        let info = TransferInfo::new("/data/disk.vhd", "https://a/b", 1000, 4096);
        assert!(!info.is_page_blob_eligible());

        // 非 vhd
        let info = TransferInfo::new("/data/disk.img", "https://a/b", 1024, 4096);
        assert!(!info.is_page_blob_eligible());

        // 显式指定
        let info = TransferInfo::new("/data/disk.img", "https://a/b", 1024, 4096)
            .with_blob_type(BlobTypeHint::PageBlob);
        assert!(info.is_page_blob_eligible());

        let info = TransferInfo::new("/data/disk.vhd", "https://a/b", 1024, 4096)
            .with_blob_type(BlobTypeHint::BlockBlob);
        assert!(!info.is_page_blob_eligible());
    }

    #[test]
    fn test_status_serde() {
        let json = toml::Value::try_from(TransferStatus::TierSetFailure).unwrap();
        assert_eq!(json.as_str(), Some("tier_set_failure"));
    }
}
