use anyhow::{Context, Result};
use blob_upload_engine::{
    logging, upload_local_to_blob, AppConfig, ChunkWorkerPool, JobPartTransfer, Pacer,
    PartTransferManager, RestBlobClient, TransferInfo, TransferStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/blob-upload.toml";

const USAGE: &str = "用法: blob-upload <本地文件> <目标 Blob URL（含 SAS）> [配置文件]";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (source, destination) = match (args.first(), args.get(1)) {
        (Some(source), Some(destination)) => (PathBuf::from(source), destination.clone()),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };
    let config_path = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = AppConfig::load_or_default(&config_path).await;
    config.upload.validate().context("上传配置无效")?;

    // 初始化日志系统（必须保持 guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    let source_size = tokio::fs::metadata(&source)
        .await
        .with_context(|| format!("无法读取源文件信息: {:?}", source))?
        .len();

    let upload = &config.upload;
    let mut info = TransferInfo::new(
        &source,
        destination.as_str(),
        source_size,
        upload.block_size_bytes(),
    )
    .with_force_overwrite(upload.force_overwrite)
    .with_tiers(upload.tier_settings());
    info.metadata
        .insert("uploaded_by".to_string(), "blob-upload".to_string());

    info!(
        "开始上传: {:?} -> {} ({} bytes, 分片 {} MB, 线程 {})",
        source, destination, source_size, upload.block_size_mb, upload.max_workers
    );

    let client = RestBlobClient::new(&destination, upload.request_timeout())
        .context("创建 Blob 客户端失败")?;
    let pool = ChunkWorkerPool::new(upload.max_workers, upload.queue_capacity);
    let pacer = Arc::new(Pacer::new(upload.max_bytes_per_second));
    let jptm = Arc::new(JobPartTransfer::new(info, pool.clone()));

    // Ctrl+C 取消传输，已开始的请求会自然结束
    {
        let ctx = jptm.context();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("收到 Ctrl+C，取消上传...");
                ctx.cancel();
            }
        });
    }

    let result = upload_local_to_blob(jptm.clone(), Arc::new(client), pacer).await;
    let status = jptm.wait_done().await;
    pool.shutdown().await;

    if let Err(e) = result {
        error!("上传引擎内部错误: {}", e);
        anyhow::bail!("上传中止: {}", e);
    }

    println!(
        "{}: {:?} ({} bytes)",
        source.display(),
        status,
        jptm.bytes_done()
    );
    if status != TransferStatus::Success {
        std::process::exit(1);
    }
    Ok(())
}
