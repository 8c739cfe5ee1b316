//! xDS control plane Server Entry Point

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use xdscp::config::ProbeConfig;
use xdscp::discovery::StreamTracker;
use xdscp::health::{HttpProber, ProbeScheduler};
use xdscp::registry::EndpointRegistry;
use xdscp::snapshot::SnapshotStore;
use xdscp::watcher::ConfigWatcher;
use xdscp::{config, logging, server, AppState};

#[derive(Parser)]
#[command(name = "xdscp", version, about = "Envoy xDS control plane")]
struct Cli {
    /// グループ別configファイルのディレクトリ
    #[arg(long, env = "XDSCP_CONFIG_DIR", default_value = "./config")]
    config_dir: PathBuf,

    /// 管理サーバのバインドアドレス
    #[arg(long, env = "XDSCP_HOST", default_value = "0.0.0.0")]
    host: String,

    /// 管理サーバのポート
    #[arg(long, env = "XDSCP_PORT", default_value_t = 18080)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init()?;

    info!("xDS control plane v{}", env!("CARGO_PKG_VERSION"));

    let store = SnapshotStore::new();

    let probe_config = ProbeConfig::from_env();
    let scheduler = ProbeScheduler::new(
        Arc::new(HttpProber::new(probe_config.timeout)),
        probe_config.interval,
        probe_config.max_attempts,
    );
    let registry = EndpointRegistry::new(store.clone(), scheduler);

    let watcher = ConfigWatcher::new(
        &cli.config_dir,
        config::get_default_group(),
        store.clone(),
        registry.clone(),
    );

    // 初回ロードの失敗（configディレクトリ不正・YAML破損）は起動を中止する
    watcher.load_all().await?;
    watcher.spawn_watch(config::get_watch_interval());
    info!(dir = %cli.config_dir.display(), "Configuration watcher started");

    let tracker = StreamTracker::new(registry.clone());

    let state = AppState {
        snapshots: store,
        registry,
        watcher,
        tracker,
    };

    server::run(state, &cli.host, cli.port).await
}
