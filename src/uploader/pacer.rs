//! 上传限速
//!
//! `Pacer` 是所有传输共享的字节速率限制器，只提供一个操作：
//! `request(n).await` 在配额允许时返回。
//! `PacedBody` 把源文件的一段字节包装成按片限速的请求体，
//! 是远端写入唯一使用的请求体类型

use crate::uploader::SourceRange;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// 请求体每片最大字节数: 64KB
pub const PACED_PIECE_SIZE: usize = 64 * 1024;

/// 字节速率限制器（令牌桶）
///
/// 桶容量为一秒的配额；单次请求可以超过当前余额，
/// 超出部分记为欠账，后续请求需要等到欠账还清
#[derive(Debug)]
pub struct Pacer {
    /// 每秒字节数，0 表示不限速
    bytes_per_second: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// 当前可用字节数（可能为负）
    available: f64,
    last_refill: Instant,
}

impl Pacer {
    /// 创建限速器
    ///
    /// # 参数
    /// * `bytes_per_second` - 每秒字节数，0 表示不限速
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            state: Mutex::new(BucketState {
                available: bytes_per_second as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 不限速
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_second == 0
    }

    /// 等待直到允许发送 n 个字节
    pub async fn request(&self, n: u64) {
        loop {
            match self.reserve(n, Instant::now()) {
                None => return,
                Some(wait) => {
                    trace!("限速等待 {:?} ({} bytes)", wait, n);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// 尝试预留 n 个字节
    ///
    /// 成功返回 None；否则返回需要等待的时长（此时不扣减配额）
    fn reserve(&self, n: u64, now: Instant) -> Option<Duration> {
        if self.is_unlimited() {
            return None;
        }

        let rate = self.bytes_per_second as f64;
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.available = (state.available + elapsed * rate).min(rate);
        state.last_refill = now;

        if state.available > 0.0 {
            state.available -= n as f64;
            None
        } else {
            let deficit = -state.available;
            Some(Duration::from_secs_f64(deficit / rate).max(Duration::from_millis(1)))
        }
    }
}

/// 限速请求体
#[derive(Debug, Clone)]
pub struct PacedBody {
    /// 源文件中的偏移（用于日志和定位）
    offset: u64,
    /// 数据，None 表示空请求体
    data: Option<SourceRange>,
    pacer: Arc<Pacer>,
}

impl PacedBody {
    /// 包装源文件中从 offset 开始的一段字节
    pub fn new(offset: u64, data: SourceRange, pacer: Arc<Pacer>) -> Self {
        Self {
            offset,
            data: Some(data),
            pacer,
        }
    }

    /// 空请求体（空对象上传）
    pub fn empty(pacer: Arc<Pacer>) -> Self {
        Self {
            offset: 0,
            data: None,
            pacer,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.data.as_ref().map(|d| d.len() as u64).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 转换为按片限速的字节流
    ///
    /// 每片在限速器放行后才产出
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
        let pacer = self.pacer;
        let data = self.data;
        stream::unfold(0usize, move |pos| {
            let pacer = pacer.clone();
            let data = data.clone();
            async move {
                let data = data?;
                if pos >= data.len() {
                    return None;
                }
                let end = (pos + PACED_PIECE_SIZE).min(data.len());
                pacer.request((end - pos) as u64).await;
                let piece = data.slice(pos, end).to_vec();
                Some((Ok(piece), end))
            }
        })
    }

    /// 读取全部字节（经过限速）
    pub async fn read_all(self) -> Vec<u8> {
        use futures::StreamExt;

        let mut out = Vec::with_capacity(self.len() as usize);
        let mut stream = Box::pin(self.into_stream());
        while let Some(piece) = stream.next().await {
            if let Ok(piece) = piece {
                out.extend_from_slice(&piece);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::SourceMapping;
    use futures::StreamExt;

    #[test]
    fn test_unlimited_never_waits() {
        let pacer = Pacer::unlimited();
        let now = Instant::now();
        for _ in 0..100 {
            assert!(pacer.reserve(u64::MAX / 2, now).is_none());
        }
    }

    #[test]
    fn test_bucket_refill() {
        let pacer = Pacer::new(1000);
        let start = Instant::now();

        // 初始桶满，可以透支一次
        assert!(pacer.reserve(1500, start).is_none());

        // 欠账 500 字节，需要等待 0.5 秒
        let wait = pacer.reserve(100, start).unwrap();
        assert!(wait >= Duration::from_millis(450) && wait <= Duration::from_millis(550));

        // 0.6 秒后欠账还清
        assert!(pacer
            .reserve(100, start + Duration::from_millis(600))
            .is_none());
    }

    #[test]
    fn test_bucket_capacity_is_one_second() {
        let pacer = Pacer::new(1000);
        let start = Instant::now();
        assert!(pacer.reserve(1000, start).is_none());

        // 空闲很久也只能积攒一秒的配额
        let later = start + Duration::from_secs(60);
        assert!(pacer.reserve(1000, later).is_none());
        assert!(pacer.reserve(1, later).is_some());
    }

    #[tokio::test]
    async fn test_paced_body_pieces() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mapping = SourceMapping::from_vec("mem", data.clone());
        let body = PacedBody::new(
            1000,
            mapping.range(1000, 150_000).unwrap(),
            Arc::new(Pacer::unlimited()),
        );
        assert_eq!(body.offset(), 1000);
        assert_eq!(body.len(), 150_000);

        let pieces: Vec<Vec<u8>> = body
            .clone()
            .into_stream()
            .map(|p| p.unwrap())
            .collect()
            .await;
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.len() <= PACED_PIECE_SIZE));

        let all = body.read_all().await;
        assert_eq!(all, data[1000..151_000]);
        mapping.release();
    }

    #[tokio::test]
    async fn test_empty_body() {
        let body = PacedBody::empty(Arc::new(Pacer::unlimited()));
        assert!(body.is_empty());
        assert!(body.read_all().await.is_empty());
    }
}
