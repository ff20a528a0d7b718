// Blob REST 客户端实现
//
// 通过带 SAS 的目标 URL 直接调用 Blob REST 接口：
// - HEAD                 获取属性（判断目标是否已存在）
// - PUT                  整体上传 / 创建页 Blob
// - PUT comp=block       暂存块
// - PUT comp=blocklist   提交块列表
// - PUT comp=page        写入页范围
// - PUT comp=tier        设置访问层级
// - DELETE               删除（清理未提交的块或失败的对象）

use crate::blob::{
    AccessTier, BlobDestination, BlobHttpHeaders, BlobProperties, Metadata, RemoteError,
};
use crate::uploader::PacedBody;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// REST API 版本
pub const SERVICE_VERSION: &str = "2020-04-08";

/// 错误响应体最多保留的字符数
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Blob REST 客户端
#[derive(Debug, Clone)]
pub struct RestBlobClient {
    /// HTTP客户端
    client: Client,
    /// 目标 URL（可带 SAS 查询串）
    url: String,
}

impl RestBlobClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `destination` - 目标 Blob URL
    /// * `timeout` - 单次请求超时
    pub fn new(destination: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Self::with_client(client, destination)
    }

    /// 复用已有的 HTTP 客户端（多个传输共享连接池）
    pub fn with_client(client: Client, destination: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(destination)
            .with_context(|| format!("无效的目标地址: {}", destination))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("目标地址必须是 http(s) URL: {}", destination);
        }

        Ok(Self {
            client,
            url: destination.to_string(),
        })
    }

    /// 在目标 URL 上追加查询参数
    fn build_url(&self, params: &[(&str, &str)]) -> String {
        build_url(&self.url, params)
    }

    /// 发送请求并把非 2xx 响应转换为 RemoteError
    async fn send(&self, op: &str, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request
            .headers(common_headers())
            .send()
            .await
            .map_err(|e| RemoteError::transport(format!("{} 请求发送失败: {}", op, e)))?;

        let status = response.status();
        if status.is_success() {
            debug!("{} 成功: status={}", op, status);
            return Ok(response);
        }

        let code = response
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            format!("{} 失败", op)
        } else {
            format!(
                "{} 失败: {}",
                op,
                body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>()
            )
        };

        if status.as_u16() != crate::blob::STATUS_NOT_FOUND {
            warn!("{} 返回错误: status={}, code={:?}", op, status, code);
        }

        Err(RemoteError::new(status.as_u16(), code, message))
    }

    fn body_request(&self, url: String, body: PacedBody) -> RequestBuilder {
        let len = body.len();
        self.client
            .put(url)
            .header(CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(body.into_stream()))
    }
}

#[async_trait]
impl BlobDestination for RestBlobClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn get_properties(&self) -> Result<BlobProperties, RemoteError> {
        let response = self
            .send("GetProperties", self.client.head(&self.url))
            .await?;

        let headers = response.headers();
        let header_str =
            |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);

        Ok(BlobProperties {
            content_length: header_str("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            blob_type: header_str("x-ms-blob-type"),
            etag: header_str("etag"),
        })
    }

    async fn upload_whole_object(
        &self,
        body: PacedBody,
        headers: &BlobHttpHeaders,
        metadata: &Metadata,
    ) -> Result<(), RemoteError> {
        let mut extra = blob_headers(headers, metadata)?;
        extra.insert("x-ms-blob-type", HeaderValue::from_static("BlockBlob"));

        let request = self.body_request(self.url.clone(), body).headers(extra);
        self.send("PutBlob", request).await?;
        Ok(())
    }

    async fn stage_block(&self, block_id: &str, body: PacedBody) -> Result<(), RemoteError> {
        let url = self.build_url(&[("comp", "block"), ("blockid", block_id)]);
        self.send("PutBlock", self.body_request(url, body)).await?;
        Ok(())
    }

    async fn commit_block_list(
        &self,
        block_ids: &[String],
        headers: &BlobHttpHeaders,
        metadata: &Metadata,
    ) -> Result<(), RemoteError> {
        let url = self.build_url(&[("comp", "blocklist")]);
        let xml = block_list_xml(block_ids)
            .map_err(|e| RemoteError::transport(format!("块列表序列化失败: {}", e)))?;

        let request = self
            .client
            .put(url)
            .headers(blob_headers(headers, metadata)?)
            .header("content-type", "application/xml")
            .header(CONTENT_LENGTH, xml.len())
            .body(xml);
        self.send("PutBlockList", request).await?;
        Ok(())
    }

    async fn create_page_blob(
        &self,
        size: u64,
        headers: &BlobHttpHeaders,
        metadata: &Metadata,
    ) -> Result<(), RemoteError> {
        let mut extra = blob_headers(headers, metadata)?;
        extra.insert("x-ms-blob-type", HeaderValue::from_static("PageBlob"));
        extra.insert("x-ms-blob-content-length", HeaderValue::from(size));
        extra.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));

        let request = self.client.put(&self.url).headers(extra);
        self.send("PutPageBlob", request).await?;
        Ok(())
    }

    async fn upload_page_range(&self, offset: u64, body: PacedBody) -> Result<(), RemoteError> {
        let url = self.build_url(&[("comp", "page")]);
        let range = page_range_header(offset, body.len());

        let request = self
            .body_request(url, body)
            .header("x-ms-page-write", "update")
            .header("x-ms-range", range);
        self.send("PutPage", request).await?;
        Ok(())
    }

    async fn set_tier(&self, tier: AccessTier) -> Result<(), RemoteError> {
        let url = self.build_url(&[("comp", "tier")]);
        let request = self
            .client
            .put(url)
            .header("x-ms-access-tier", tier.as_str())
            .header(CONTENT_LENGTH, 0);
        self.send("SetTier", request).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<(), RemoteError> {
        self.send("DeleteBlob", self.client.delete(&self.url))
            .await?;
        Ok(())
    }
}

/// 在 URL 上追加查询参数（保留已有的 SAS 查询串）
fn build_url(base: &str, params: &[(&str, &str)]) -> String {
    let mut url = base.to_string();
    for (i, (key, value)) in params.iter().enumerate() {
        let sep = if i == 0 && !base.contains('?') { '?' } else { '&' };
        url.push(sep);
        url.push_str(key);
        url.push('=');
        url.push_str(&urlencoding::encode(value));
    }
    url
}

/// 每个请求都携带的版本和时间头
fn common_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-ms-version", HeaderValue::from_static(SERVICE_VERSION));
    if let Ok(date) = HeaderValue::from_str(&rfc1123_now()) {
        headers.insert("x-ms-date", date);
    }
    headers
}

fn rfc1123_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// 内容头和元数据头
fn blob_headers(headers: &BlobHttpHeaders, metadata: &Metadata) -> Result<HeaderMap, RemoteError> {
    let mut map = HeaderMap::new();

    let content_headers = [
        ("x-ms-blob-content-type", &headers.content_type),
        ("x-ms-blob-content-encoding", &headers.content_encoding),
        ("x-ms-blob-content-language", &headers.content_language),
        ("x-ms-blob-content-disposition", &headers.content_disposition),
        ("x-ms-blob-cache-control", &headers.cache_control),
    ];
    for (name, value) in content_headers {
        if let Some(value) = value {
            map.insert(name, header_value(name, value)?);
        }
    }

    for (key, value) in metadata {
        let name = format!("x-ms-meta-{}", key);
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| RemoteError::transport(format!("非法的元数据名: {}", key)))?;
        map.insert(header_name, header_value(&name, value)?);
    }

    Ok(map)
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, RemoteError> {
    HeaderValue::from_str(value)
        .map_err(|_| RemoteError::transport(format!("非法的请求头取值: {}={}", name, value)))
}

/// 块列表提交请求体
#[derive(Debug, Serialize)]
#[serde(rename = "BlockList")]
struct BlockListBody<'a> {
    #[serde(rename = "Latest")]
    latest: &'a [String],
}

fn block_list_xml(block_ids: &[String]) -> Result<String, quick_xml::DeError> {
    let body = quick_xml::se::to_string(&BlockListBody { latest: block_ids })?;
    Ok(format!(r#"<?xml version="1.0" encoding="utf-8"?>{}"#, body))
}

/// x-ms-range 头（闭区间）
fn page_range_header(offset: u64, len: u64) -> String {
    format!("bytes={}-{}", offset, offset + len.saturating_sub(1))
}
