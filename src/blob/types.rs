// Blob 目标端类型定义
//
// 上传引擎只通过 BlobDestination 这个契约访问远端，
// 具体的 HTTP 实现见 client.rs，测试中使用内存记录实现

use crate::uploader::PacedBody;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 用户自定义元数据（x-ms-meta-*）
pub type Metadata = BTreeMap<String, String>;

/// HTTP "Not Found"
pub const STATUS_NOT_FOUND: u16 = 404;

/// 远端请求错误
///
/// 在调用点被转换为 (状态码, 消息)，并带上源/目标上下文写入日志
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("远端请求失败: status={status}, code={}, {message}", .code.as_deref().unwrap_or("-"))]
pub struct RemoteError {
    /// HTTP 状态码（传输层错误时为 0）
    pub status: u16,
    /// 服务端错误码（x-ms-error-code）
    pub code: Option<String>,
    /// 错误信息
    pub message: String,
}

impl RemoteError {
    pub fn new(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// 传输层错误（连接失败、超时等，没有 HTTP 状态码）
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(0, None, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(STATUS_NOT_FOUND, Some("BlobNotFound".to_string()), message)
    }

    /// 目标不存在
    pub fn is_not_found(&self) -> bool {
        self.status == STATUS_NOT_FOUND
    }

    /// 转换为 (状态码, 消息)
    pub fn status_and_message(&self) -> (u16, String) {
        match &self.code {
            Some(code) => (self.status, format!("{}: {}", code, self.message)),
            None => (self.status, self.message.clone()),
        }
    }
}

/// 目标端内容头
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHttpHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
}

/// 访问层级
///
/// Hot/Cool/Cold/Archive 用于块 Blob，P* 用于高级页 Blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessTier {
    Hot,
    Cool,
    Cold,
    Archive,
    P4,
    P6,
    P10,
    P15,
    P20,
    P30,
    P40,
    P50,
    P60,
    P70,
    P80,
}

impl AccessTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessTier::Hot => "Hot",
            AccessTier::Cool => "Cool",
            AccessTier::Cold => "Cold",
            AccessTier::Archive => "Archive",
            AccessTier::P4 => "P4",
            AccessTier::P6 => "P6",
            AccessTier::P10 => "P10",
            AccessTier::P15 => "P15",
            AccessTier::P20 => "P20",
            AccessTier::P30 => "P30",
            AccessTier::P40 => "P40",
            AccessTier::P50 => "P50",
            AccessTier::P60 => "P60",
            AccessTier::P70 => "P70",
            AccessTier::P80 => "P80",
        }
    }

    /// 是否为页 Blob 层级
    pub fn is_page_tier(&self) -> bool {
        self.as_str().starts_with('P')
    }
}

impl fmt::Display for AccessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tier = match s.to_ascii_lowercase().as_str() {
            "hot" => AccessTier::Hot,
            "cool" => AccessTier::Cool,
            "cold" => AccessTier::Cold,
            "archive" => AccessTier::Archive,
            "p4" => AccessTier::P4,
            "p6" => AccessTier::P6,
            "p10" => AccessTier::P10,
            "p15" => AccessTier::P15,
            "p20" => AccessTier::P20,
            "p30" => AccessTier::P30,
            "p40" => AccessTier::P40,
            "p50" => AccessTier::P50,
            "p60" => AccessTier::P60,
            "p70" => AccessTier::P70,
            "p80" => AccessTier::P80,
            _ => return Err(format!("未知的访问层级: {}", s)),
        };
        Ok(tier)
    }
}

/// 提交后要设置的层级（None 表示不设置）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSettings {
    /// 块 Blob 层级
    #[serde(default)]
    pub block_blob: Option<AccessTier>,
    /// 页 Blob 层级
    #[serde(default)]
    pub page_blob: Option<AccessTier>,
}

/// 目标 Blob 属性（HEAD 返回）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    pub content_length: u64,
    pub blob_type: Option<String>,
    pub etag: Option<String>,
}

/// 上传目标端契约
///
/// 每个方法对应一次远端调用，失败时返回带状态码的 RemoteError。
/// 重试策略属于实现方（网络层），引擎不做重试
#[async_trait]
pub trait BlobDestination: Send + Sync {
    /// 目标地址（仅用于日志）
    fn url(&self) -> &str;

    async fn get_properties(&self) -> Result<BlobProperties, RemoteError>;

    /// 整体上传（Put Blob），body 为空时上传空对象
    async fn upload_whole_object(
        &self,
        body: PacedBody,
        headers: &BlobHttpHeaders,
        metadata: &Metadata,
    ) -> Result<(), RemoteError>;

    async fn stage_block(&self, block_id: &str, body: PacedBody) -> Result<(), RemoteError>;

    /// 按顺序提交块列表，一次原子操作
    async fn commit_block_list(
        &self,
        block_ids: &[String],
        headers: &BlobHttpHeaders,
        metadata: &Metadata,
    ) -> Result<(), RemoteError>;

    /// 创建固定大小的页 Blob
    async fn create_page_blob(
        &self,
        size: u64,
        headers: &BlobHttpHeaders,
        metadata: &Metadata,
    ) -> Result<(), RemoteError>;

    /// 写入页范围 [offset, offset + body.len())
    async fn upload_page_range(&self, offset: u64, body: PacedBody) -> Result<(), RemoteError>;

    async fn set_tier(&self, tier: AccessTier) -> Result<(), RemoteError>;

    async fn delete(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_not_found() {
        let err = RemoteError::not_found("missing");
        assert!(err.is_not_found());
        assert_eq!(err.status, 404);

        let err = RemoteError::transport("connection reset");
        assert!(!err.is_not_found());
        assert_eq!(err.status_and_message(), (0, "connection reset".to_string()));
    }

    #[test]
    fn test_remote_error_status_and_message_includes_code() {
        let err = RemoteError::new(409, Some("BlobAlreadyExists".to_string()), "exists");
        let (status, msg) = err.status_and_message();
        assert_eq!(status, 409);
        assert_eq!(msg, "BlobAlreadyExists: exists");
    }

    #[test]
    fn test_access_tier_parse() {
        assert_eq!("hot".parse::<AccessTier>().unwrap(), AccessTier::Hot);
        assert_eq!("Archive".parse::<AccessTier>().unwrap(), AccessTier::Archive);
        assert_eq!("P30".parse::<AccessTier>().unwrap(), AccessTier::P30);
        assert!("warm".parse::<AccessTier>().is_err());

        assert!(AccessTier::P10.is_page_tier());
        assert!(!AccessTier::Cool.is_page_tier());
        assert_eq!(AccessTier::Cold.to_string(), "Cold");
    }
}
