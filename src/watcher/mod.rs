//! 設定ファイル監視
//!
//! node-groupごとのYAML configファイルをディレクトリから読み込み、
//! スナップショットに反映する。defaultグループのリソースは他の全グループに
//! 片方向でマージされる（defaultグループ自身には他グループのリソースは
//! 混ざらない）。初回ロード完了まではreadinessゲートで配信側を待たせる。

use crate::common::{CpError, CpResult};
use crate::registry::EndpointRegistry;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::types::{Bootstrap, StaticResources};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// ロード済みグループconfigと診断情報
#[derive(Default)]
struct WatcherState {
    groups: HashMap<String, StaticResources>,
    last_modified: Option<DateTime<Utc>>,
}

/// configディレクトリの監視とスナップショット合成
#[derive(Clone)]
pub struct ConfigWatcher {
    config_dir: PathBuf,
    default_group: String,
    store: SnapshotStore,
    registry: EndpointRegistry,
    state: Arc<RwLock<WatcherState>>,
    ready_tx: Arc<watch::Sender<bool>>,
    ready_rx: watch::Receiver<bool>,
}

impl ConfigWatcher {
    /// 新しいwatcherを作成（この時点ではまだ何も読み込まない）
    pub fn new(
        config_dir: impl Into<PathBuf>,
        default_group: impl Into<String>,
        store: SnapshotStore,
        registry: EndpointRegistry,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            config_dir: config_dir.into(),
            default_group: default_group.into(),
            store,
            registry,
            state: Arc::new(RwLock::new(WatcherState::default())),
            ready_tx: Arc::new(ready_tx),
            ready_rx,
        }
    }

    /// configディレクトリの全ファイルを読み込み、全グループのスナップショットを再構築する
    ///
    /// 全ファイルをパースしてから一括でコミットする。1ファイルでもパースに
    /// 失敗した場合はエラーを返し、既存のスナップショットには一切触れない。
    pub async fn load_all(&self) -> CpResult<()> {
        let dir = &self.config_dir;
        let meta = tokio::fs::metadata(dir)
            .await
            .map_err(|_| CpError::ConfigDirectory(dir.display().to_string()))?;
        if !meta.is_dir() {
            return Err(CpError::ConfigDirectory(dir.display().to_string()));
        }

        // パースフェーズ（失敗したら何も反映しない）
        let mut parsed: HashMap<String, StaticResources> = HashMap::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(group) = group_name_of(&path) else {
                continue;
            };
            let resources = parse_config_file(&path).await?;
            parsed.insert(group, resources);
        }

        // コミットフェーズ
        let group_count = parsed.len();
        {
            let mut state = self.state.write().await;
            state.groups = parsed;
            state.last_modified = Some(Utc::now());
        }
        self.publish_all().await;

        info!(dir = %dir.display(), groups = group_count, "Configuration loaded");

        // 初回ロード完了でreadinessゲートを開く
        self.ready_tx.send_replace(true);
        Ok(())
    }

    /// 単一ファイルの変更を反映する（監視ループ用）
    ///
    /// defaultグループのファイルだった場合は全グループのスナップショットを
    /// 再構築する。それ以外はそのグループだけを再構築する。
    pub async fn load_file(&self, path: &Path) -> CpResult<()> {
        let Some(group) = group_name_of(path) else {
            return Ok(());
        };
        let resources = parse_config_file(path).await?;

        {
            let mut state = self.state.write().await;
            state.groups.insert(group.clone(), resources);
            state.last_modified = Some(Utc::now());
        }

        if group == self.default_group {
            debug!(group = %group, "Default group changed, republishing all groups");
            self.publish_all().await;
        } else {
            self.publish_group(&group).await;
        }
        Ok(())
    }

    /// バックグラウンドのファイル監視タスクを開始する
    ///
    /// mtimeのポーリングで変更を検出する。監視中のreloadの失敗はログに残して
    /// スキップし、既存のスナップショットを維持する。
    pub fn spawn_watch(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut mtimes = watcher.scan_mtimes().await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let current = watcher.scan_mtimes().await;
                for (path, mtime) in &current {
                    if mtimes.get(path) == Some(mtime) {
                        continue;
                    }
                    info!(file = %path.display(), "Config file changed, reloading");
                    if let Err(err) = watcher.load_file(path).await {
                        error!(file = %path.display(), error = %err, "Config reload failed");
                    }
                }
                mtimes = current;
            }
        })
    }

    /// 初回ロード完了を待ってからスナップショットstoreを返す
    ///
    /// discoveryエンジン側の初期化がここを通ることで、部分的にしか構築されて
    /// いないキャッシュを観測しないことを保証する。
    pub async fn store(&self) -> SnapshotStore {
        self.wait_ready().await;
        self.store.clone()
    }

    /// 初回ロード完了まで待つ
    ///
    /// 既に完了している場合は即座に戻る。複数のタスクが同時に待てる。
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// 最終ロード時刻を返す（診断用）
    pub async fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_modified
    }

    async fn publish_all(&self) {
        let groups: Vec<String> = self.state.read().await.groups.keys().cloned().collect();
        for group in groups {
            self.publish_group(&group).await;
        }
    }

    /// 1グループ分のスナップショットを合成してstoreに設定する
    ///
    /// defaultグループ: 自身のリソースのみ、endpointは空。
    /// それ以外: 自身のリソース + defaultのリソース、endpointは
    /// マージ後のクラスタ名でレジストリ射影を絞り込んだもの。
    async fn publish_group(&self, group: &str) {
        let merged = {
            let state = self.state.read().await;
            let Some(own) = state.groups.get(group) else {
                return;
            };
            let mut merged = own.clone();
            if group != self.default_group {
                if let Some(default) = state.groups.get(&self.default_group) {
                    merged.clusters.extend(default.clusters.iter().cloned());
                    merged.listeners.extend(default.listeners.iter().cloned());
                    merged.secrets.extend(default.secrets.iter().cloned());
                }
            }
            merged
        };

        let endpoints = if group == self.default_group {
            Vec::new()
        } else {
            let cluster_names: HashSet<String> =
                merged.clusters.iter().map(|c| c.name.clone()).collect();
            self.registry.endpoints_for(&cluster_names).await
        };

        let snapshot = Snapshot {
            clusters: merged.clusters,
            endpoints,
            listeners: merged.listeners,
            routes: Vec::new(),
            secrets: merged.secrets,
            version: self.store.make_version(),
        };
        self.store.set(group, snapshot).await;
    }

    /// 認識対象ファイルのmtime一覧を取る
    async fn scan_mtimes(&self) -> HashMap<PathBuf, SystemTime> {
        let mut mtimes = HashMap::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.config_dir).await else {
            warn!(dir = %self.config_dir.display(), "Config directory not readable");
            return mtimes;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if group_name_of(&path).is_none() {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                if let Ok(mtime) = meta.modified() {
                    mtimes.insert(path, mtime);
                }
            }
        }
        mtimes
    }
}

/// ファイルパスからグループ名を導く
///
/// 拡張子（最後の`.`以降）が`yml`/`yaml`（大文字小文字不問）のファイルのみ
/// 認識し、グループ名はファイル名の最初の`.`より前の部分。どちらの条件も
/// 満たさないファイルはNone（無視）。
fn group_name_of(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case("yml") && !ext.eq_ignore_ascii_case("yaml") {
        return None;
    }
    let file_name = path.file_name()?.to_str()?;
    let group = file_name.split('.').next()?;
    if group.is_empty() {
        return None;
    }
    Some(group.to_string())
}

async fn parse_config_file(path: &Path) -> CpResult<StaticResources> {
    let text = tokio::fs::read_to_string(path).await?;
    let bootstrap: Bootstrap =
        serde_yaml::from_str(&text).map_err(|source| CpError::ConfigParse {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            source,
        })?;
    Ok(bootstrap.static_resources)
}
