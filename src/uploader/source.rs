// 源文件访问
//
// 源文件以只读方式整体映射到内存，所有分片任务共享同一个映射并按范围切片。
// 映射由收尾的那一个分片任务显式释放，且只释放一次

use crate::uploader::UploadError;
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 共享的只读字节
pub type SharedBytes = Arc<dyn AsRef<[u8]> + Send + Sync>;

/// 源文件映射
pub struct SourceMapping {
    /// 源文件路径
    path: PathBuf,
    /// 映射长度（即传输的源大小）
    len: u64,
    /// 映射本体，释放后为 None
    bytes: Mutex<Option<SharedBytes>>,
    /// release() 调用次数
    release_calls: AtomicUsize,
}

impl SourceMapping {
    /// 打开源文件并建立只读映射
    ///
    /// # 参数
    /// * `path` - 源文件路径
    /// * `len` - 传输信息中记录的源大小（必须大于 0）
    pub fn open(path: &Path, len: u64) -> Result<Self, UploadError> {
        let file = File::open(path).map_err(|e| UploadError::SourceOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

        // 映射期间源文件不应被截断
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| UploadError::SourceMap {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if (mmap.len() as u64) < len {
            return Err(UploadError::SourceMap {
                path: path.to_path_buf(),
                reason: format!("文件大小 {} 小于传输记录的大小 {}", mmap.len(), len),
            });
        }

        debug!("源文件映射完成: {:?}, {} bytes", path, len);
        Ok(Self::with_bytes(path.to_path_buf(), len, Arc::new(mmap)))
    }

    /// 使用内存中的数据构造（不经过文件）
    pub fn from_vec(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self::with_bytes(path.into(), len, Arc::new(data))
    }

    fn with_bytes(path: PathBuf, len: u64, bytes: SharedBytes) -> Self {
        Self {
            path,
            len,
            bytes: Mutex::new(Some(bytes)),
            release_calls: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 获取字节范围 [offset, offset + len)
    pub fn range(&self, offset: u64, len: u64) -> Result<SourceRange, UploadError> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.len)
            .ok_or(UploadError::RangeOutOfBounds {
                offset,
                len,
                size: self.len,
            })?;

        let bytes = self
            .bytes
            .lock()
            .clone()
            .ok_or(UploadError::SourceUnavailable)?;

        Ok(SourceRange {
            bytes,
            start: offset as usize,
            end: end as usize,
        })
    }

    /// 文件头部最多 n 个字节（用于内容类型嗅探）
    pub fn head(&self, n: u64) -> Option<SourceRange> {
        self.range(0, n.min(self.len)).ok()
    }

    /// 释放映射
    ///
    /// 第一次调用返回 true；重复调用记录错误并返回 false。
    /// 已经切出的 SourceRange 在自身被丢弃前仍然有效
    pub fn release(&self) -> bool {
        let calls = self.release_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.bytes.lock().take() {
            Some(_) => {
                debug!("源文件映射已释放: {:?}", self.path);
                true
            }
            None => {
                error!(
                    "源文件映射被重复释放: {:?} (第 {} 次调用)",
                    self.path, calls
                );
                false
            }
        }
    }

    /// 是否已释放
    pub fn is_released(&self) -> bool {
        self.bytes.lock().is_none()
    }

    /// release() 被调用的次数
    pub fn release_count(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

impl Drop for SourceMapping {
    fn drop(&mut self) {
        if self.bytes.get_mut().is_some() {
            warn!("源文件映射未经释放即被丢弃: {:?}", self.path);
        }
    }
}

impl std::fmt::Debug for SourceMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceMapping")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("released", &self.is_released())
            .finish()
    }
}

/// 映射中的一段只读字节
#[derive(Clone)]
pub struct SourceRange {
    bytes: SharedBytes,
    start: usize,
    end: usize,
}

impl SourceRange {
    /// 在本范围内再切一段（相对偏移）
    pub fn slice(&self, from: usize, to: usize) -> SourceRange {
        let start = (self.start + from).min(self.end);
        let end = (self.start + to).clamp(start, self.end);
        SourceRange {
            bytes: self.bytes.clone(),
            start,
            end,
        }
    }
}

impl Deref for SourceRange {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &AsRef::<[u8]>::as_ref(&*self.bytes)[self.start..self.end]
    }
}

impl std::fmt::Debug for SourceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourceRange({}..{})", self.start, self.end)
    }
}

const WORD: usize = std::mem::size_of::<usize>();

/// 判断字节是否全为零
///
/// 按机器字长步进比较，剩余不足一个字的尾部逐字节比较
pub fn is_all_zero(buf: &[u8]) -> bool {
    let words = buf.chunks_exact(WORD);
    let tail = words.remainder();

    for word in words {
        let value = <[u8; WORD]>::try_from(word).map(usize::from_ne_bytes);
        if !matches!(value, Ok(0)) {
            return false;
        }
    }

    tail.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_and_range() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello mapped world").unwrap();
        file.flush().unwrap();

        let mapping = SourceMapping::open(file.path(), 18).unwrap();
        assert_eq!(mapping.len(), 18);
        assert_eq!(&*mapping.range(6, 6).unwrap(), b"mapped");
        assert!(mapping.range(10, 9).is_err());

        assert!(mapping.release());
    }

    #[test]
    fn test_open_missing_file() {
        let err = SourceMapping::open(Path::new("/nonexistent/blob-upload-src"), 10).unwrap_err();
        assert!(matches!(err, UploadError::SourceOpen { .. }));
    }

    #[test]
    fn test_open_rejects_shrunk_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"short").unwrap();
        file.flush().unwrap();

        let err = SourceMapping::open(file.path(), 100).unwrap_err();
        assert!(matches!(err, UploadError::SourceMap { .. }));
    }

    #[test]
    fn test_release_exactly_once() {
        let mapping = SourceMapping::from_vec("mem", vec![1u8; 64]);
        let range = mapping.range(0, 32).unwrap();

        assert!(mapping.release());
        assert!(mapping.is_released());
        assert!(!mapping.release());
        assert_eq!(mapping.release_count(), 2);

        // 释放后不能再切片，已切出的范围仍可读
        assert!(matches!(
            mapping.range(0, 1),
            Err(UploadError::SourceUnavailable)
        ));
        assert_eq!(range.len(), 32);
        assert!(range.iter().all(|b| *b == 1));
    }

    #[test]
    fn test_sub_slice() {
        let mapping = SourceMapping::from_vec("mem", (0u8..100).collect());
        let range = mapping.range(10, 50).unwrap();
        let sub = range.slice(5, 10);
        assert_eq!(&*sub, &[15, 16, 17, 18, 19]);
        // 越界时截断到范围末尾
        assert_eq!(range.slice(45, 100).len(), 5);
        mapping.release();
    }

    #[test]
    fn test_is_all_zero() {
        assert!(is_all_zero(&[]));
        assert!(is_all_zero(&[0u8; 4096]));
        assert!(is_all_zero(&[0u8; 13]));

        let mut buf = vec![0u8; 4099];
        buf[4098] = 1;
        assert!(!is_all_zero(&buf));
    }

    proptest! {
        #[test]
        fn prop_single_nonzero_byte_is_detected(len in 1usize..300, pos_seed in any::<usize>(), value in 1u8..=255) {
            let mut buf = vec![0u8; len];
            prop_assert!(is_all_zero(&buf));

            buf[pos_seed % len] = value;
            prop_assert!(!is_all_zero(&buf));
        }
    }
}
