// 上传分片调度器
//
// 固定数量的上传线程从有界队列中取出分片任务执行。
// 队列满时 schedule() 等待，直到有线程取走任务（背压）。
// 单个分片任务 panic 只影响该分片，线程继续处理后续任务。
// 关闭时先关闭队列拒绝新任务，再把队列中已有的任务全部执行完

use crate::uploader::UploadError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 分片任务
pub type ChunkFunc = BoxFuture<'static, ()>;

/// 默认上传线程数
pub const DEFAULT_WORKERS: usize = 16;

/// 默认队列容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// 分片上传线程池
///
/// 可以被多个传输共享（Clone 只复制句柄）
#[derive(Debug, Clone)]
pub struct ChunkWorkerPool {
    /// 任务发送端
    tx: mpsc::Sender<ChunkFunc>,
    /// 线程数
    workers: usize,
    /// 正在执行任务的线程数
    busy: Arc<AtomicUsize>,
    /// 已执行完成的任务数
    completed: Arc<AtomicUsize>,
    /// 关闭信号
    shutdown: CancellationToken,
    /// 线程句柄
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ChunkWorkerPool {
    /// 创建线程池并启动上传线程
    ///
    /// # 参数
    /// * `workers` - 上传线程数（至少 1）
    /// * `queue_capacity` - 等待队列容量（至少 1）
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);

        info!(
            "创建分片上传线程池: 线程数={}, 队列容量={}",
            workers, queue_capacity
        );

        let (tx, rx) = mpsc::channel::<ChunkFunc>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let busy = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let handles = (1..=workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    rx.clone(),
                    busy.clone(),
                    completed.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        Self {
            tx,
            workers,
            busy,
            completed,
            shutdown,
            handles: Arc::new(Mutex::new(handles)),
        }
    }

    /// 使用默认配置创建
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_QUEUE_CAPACITY)
    }

    /// 提交一个分片任务
    ///
    /// 队列满时等待；线程池已关闭时返回 SchedulerClosed
    pub async fn schedule(&self, unit: ChunkFunc) -> Result<(), UploadError> {
        if self.shutdown.is_cancelled() {
            return Err(UploadError::SchedulerClosed);
        }
        self.tx
            .send(unit)
            .await
            .map_err(|_| UploadError::SchedulerClosed)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 当前正在执行任务的线程数
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// 已执行完成的任务数
    pub fn completed_units(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 关闭线程池
    ///
    /// 之后的 schedule 返回 SchedulerClosed；已入队的任务全部执行完后才返回，
    /// 保证每个已调度的分片都能报告完成
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("上传线程退出异常: {}", e);
            }
        }
        info!("分片上传线程池已关闭");
    }
}

/// 上传线程主循环
async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<ChunkFunc>>>,
    busy: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    debug!("[上传线程{}] 已启动", worker_id);
    let mut draining = false;

    loop {
        let unit = if draining {
            rx.lock().await.recv().await
        } else {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // 关闭接收端：发送方立即失败，已缓冲的任务仍可取出
                    rx.lock().await.close();
                    draining = true;
                    debug!("[上传线程{}] 收到关闭信号，执行剩余任务", worker_id);
                    continue;
                }
                unit = async { rx.lock().await.recv().await } => unit,
            }
        };

        let Some(unit) = unit else {
            break;
        };

        busy.fetch_add(1, Ordering::SeqCst);
        if AssertUnwindSafe(unit).catch_unwind().await.is_err() {
            error!("[上传线程{}] 分片任务 panic，继续处理后续任务", worker_id);
        }
        busy.fetch_sub(1, Ordering::SeqCst);
        completed.fetch_add(1, Ordering::SeqCst);
    }

    debug!("[上传线程{}] 已退出", worker_id);
}
