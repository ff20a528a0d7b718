// 配置管理模块

use crate::blob::{AccessTier, TierSettings};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小 (MB)
    #[serde(default = "default_block_size_mb")]
    pub block_size_mb: u64,
    /// 上传线程数（所有传输共享）
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// 分片等待队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// 限速（字节/秒），0 表示不限速
    #[serde(default)]
    pub max_bytes_per_second: u64,
    /// 目标已存在时是否覆盖
    #[serde(default)]
    pub force_overwrite: bool,
    /// 块 Blob 访问层级（Hot/Cool/Cold/Archive）
    #[serde(default)]
    pub block_blob_tier: Option<AccessTier>,
    /// 页 Blob 访问层级（P4..P80）
    #[serde(default)]
    pub page_blob_tier: Option<AccessTier>,
    /// 单个请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_block_size_mb() -> u64 {
    8
}

fn default_max_workers() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size_mb: default_block_size_mb(),
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            max_bytes_per_second: 0,
            force_overwrite: false,
            block_blob_tier: None,
            page_blob_tier: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl UploadConfig {
    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.block_size_mb == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.max_workers == 0 {
            anyhow::bail!("上传线程数必须大于 0");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("分片队列容量必须大于 0");
        }
        if let Some(tier) = self.block_blob_tier {
            if tier.is_page_tier() {
                anyhow::bail!("块 Blob 不支持页层级: {}", tier);
            }
        }
        if let Some(tier) = self.page_blob_tier {
            if !tier.is_page_tier() {
                anyhow::bail!("页 Blob 只支持 P* 层级: {}", tier);
            }
        }
        Ok(())
    }

    /// 分片大小（字节）
    pub fn block_size_bytes(&self) -> u64 {
        self.block_size_mb * 1024 * 1024
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tier_settings(&self) -> TierSettings {
        TierSettings {
            block_blob: self.block_blob_tier,
            page_blob: self.page_blob_tier,
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.upload
            .validate()
            .context("保存配置失败：上传配置无效")?;

        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .await
            .context("Failed to write config file")?;
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
