//! スナップショット管理
//!
//! node-group単位のバージョン付きリソーススナップショットを保持する。
//! discoveryエンジンはこのstoreだけを参照してリソースを配信するため、
//! 更新は常にスナップショット全体の置き換えで行い、途中状態を見せない。

use crate::types::{Cluster, ClusterLoadAssignment, Listener, RouteConfiguration, Secret};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// 1グループ分のリソーススナップショット
///
/// 不変値として扱う。更新時は新しいSnapshotを作って丸ごと差し替える。
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// クラスタ一覧
    pub clusters: Vec<Cluster>,
    /// endpoint（ClusterLoadAssignment）一覧
    pub endpoints: Vec<ClusterLoadAssignment>,
    /// リスナー一覧
    pub listeners: Vec<Listener>,
    /// ルート設定一覧
    pub routes: Vec<RouteConfiguration>,
    /// シークレット一覧
    pub secrets: Vec<Secret>,
    /// バージョントークン（equalityのみで比較される）
    pub version: String,
}

/// node-group単位のスナップショットstore
///
/// 「既知のグループ」は一度でも`set()`されたグループのみ。discoveryリクエストに
/// 現れただけのグループはスナップショットを持たず、リソースも配信されない。
#[derive(Clone)]
pub struct SnapshotStore {
    groups: Arc<RwLock<HashMap<String, Arc<Snapshot>>>>,
    version: Arc<AtomicU64>,
}

impl SnapshotStore {
    /// 新しいstoreを作成
    pub fn new() -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 新しいバージョントークンを発行する
    ///
    /// store全体で厳密に増加するカウンター。同一ミリ秒内の連続更新でも
    /// トークンが重複しないことを保証する。
    pub fn make_version(&self) -> String {
        self.next_version()
    }

    /// グループのスナップショットを取得
    pub async fn get(&self, group: &str) -> Option<Arc<Snapshot>> {
        self.groups.read().await.get(group).cloned()
    }

    /// グループのスナップショットを設定する
    ///
    /// グループを「既知」として登録する。既存スナップショットは丸ごと置き換える。
    pub async fn set(&self, group: &str, snapshot: Snapshot) {
        let version = snapshot.version.clone();
        self.groups
            .write()
            .await
            .insert(group.to_string(), Arc::new(snapshot));

        debug!(group = %group, version = %version, "Snapshot set");
    }

    /// 既知のグループ一覧を返す
    pub async fn known_groups(&self) -> Vec<String> {
        self.groups.read().await.keys().cloned().collect()
    }

    /// 全既知グループのendpoint（ClusterLoadAssignment）を更新する
    ///
    /// 各グループのスナップショットのendpoints部分のみを差し替え、
    /// clusters / listeners / routes / secretsは維持する。
    /// 未知のグループには何も作らない。
    pub async fn update_endpoints_everywhere(&self, assignments: Vec<ClusterLoadAssignment>) {
        let mut groups = self.groups.write().await;

        for (group, snapshot) in groups.iter_mut() {
            let old_version = snapshot.version.clone();
            let new_version = self.next_version();

            *snapshot = Arc::new(Snapshot {
                clusters: snapshot.clusters.clone(),
                endpoints: assignments.clone(),
                listeners: snapshot.listeners.clone(),
                routes: snapshot.routes.clone(),
                secrets: snapshot.secrets.clone(),
                version: new_version.clone(),
            });

            debug!(
                group = %group,
                old_version = %old_version,
                new_version = %new_version,
                "Group endpoints updated"
            );
        }
    }

    /// 特定グループのclusters部分のみを差し替える
    ///
    /// グループが未知の場合は何もしない（エラーにもしない）。
    pub async fn replace_clusters(&self, group: &str, clusters: Vec<Cluster>) {
        let mut groups = self.groups.write().await;

        let Some(snapshot) = groups.get_mut(group) else {
            debug!(group = %group, "Cluster replace skipped for unknown group");
            return;
        };

        let new_version = self.next_version();

        *snapshot = Arc::new(Snapshot {
            clusters,
            endpoints: snapshot.endpoints.clone(),
            listeners: snapshot.listeners.clone(),
            routes: snapshot.routes.clone(),
            secrets: snapshot.secrets.clone(),
            version: new_version.clone(),
        });

        debug!(group = %group, version = %new_version, "Group clusters replaced");
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
