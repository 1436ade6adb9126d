use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use transfer_queue::{
    EngineConfig, Engine, JsonFileStore, LocalCopyOperation, TaskPriority, TransferTask,
};

const DEFAULT_CONFIG_PATH: &str = "config/transfer-queue.toml";
const DEFAULT_STATE_PATH: &str = "data/transfer-queue-state.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    info!("Transfer Queue v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("TRANSFER_QUEUE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let state_path =
        std::env::var("TRANSFER_QUEUE_STATE").unwrap_or_else(|_| DEFAULT_STATE_PATH.to_string());
    let config = EngineConfig::load_or_default(&config_path).await;

    let store = Arc::new(JsonFileStore::open(&state_path)?);
    let engine = Engine::builder(config, LocalCopyOperation::new())
        .store(store)
        .build()?;

    let restored = engine.restore()?;
    if restored > 0 {
        info!("恢复 {} 个未完成任务", restored);
    }

    // 参数按 <源路径> <目标路径> 成对给出
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() % 2 != 0 {
        warn!("参数个数为奇数，最后一个参数被忽略: {}", args[args.len() - 1]);
    }
    for pair in args.chunks_exact(2) {
        let size = tokio::fs::metadata(&pair[0])
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        engine.enqueue(
            TransferTask::with_priority(pair[0].as_str(), pair[1].as_str(), TaskPriority::Normal)
                .file_size(size),
        );
    }

    engine.start();

    tokio::select! {
        _ = engine.wait_idle(Duration::from_millis(500)) => {
            info!("队列已清空");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到退出信号");
        }
    }

    engine.shutdown().await;
    if let Err(e) = engine.persist() {
        warn!("保存队列日志失败: {}", e);
    }

    let summary = engine.stats().performance_summary();
    info!(
        "本次运行: 成功 {}, 失败 {}, 传输 {} 字节",
        summary.total_success, summary.total_failed, summary.total_bytes
    );

    Ok(())
}
