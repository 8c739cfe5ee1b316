//! エンドポイント登録管理
//!
//! クラスタ単位のendpoint集合と、そこから導出されるClusterLoadAssignment
//! 射影をメモリ内で管理する。集合の変更と射影の再計算・公開は単一の排他
//! ロック下で行い、並行するAdd/Deleteによる更新消失を防ぐ。

use crate::health::ProbeScheduler;
use crate::snapshot::SnapshotStore;
use crate::types::{ClusterLoadAssignment, EndpointInfo, EndpointKey, LbEndpoint};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// クラスタ→endpoint集合テーブルと導出済み射影
#[derive(Default)]
struct ClusterTable {
    endpoints: HashMap<String, HashSet<EndpointKey>>,
    assignments: HashMap<String, ClusterLoadAssignment>,
}

/// エンドポイントレジストリ
///
/// 動的に登録されたendpointの唯一の所有者。登録は任意でヘルスチェックを
/// 通してから反映する（health gate）。反映のたびに全クラスタ分の
/// ClusterLoadAssignmentをSnapshotStoreに公開する。
#[derive(Clone)]
pub struct EndpointRegistry {
    table: Arc<Mutex<ClusterTable>>,
    pending: Arc<StdMutex<HashSet<EndpointKey>>>,
    store: SnapshotStore,
    scheduler: ProbeScheduler,
}

impl EndpointRegistry {
    /// 新しいレジストリを作成
    pub fn new(store: SnapshotStore, scheduler: ProbeScheduler) -> Self {
        Self {
            table: Arc::new(Mutex::new(ClusterTable::default())),
            pending: Arc::new(StdMutex::new(HashSet::new())),
            store,
            scheduler,
        }
    }

    /// endpointを登録する
    ///
    /// `check_alive`が有効な場合はまずPendingProbe集合に入れ、ヘルスチェックが
    /// 成功したときだけ反映する。無効な場合は即座に反映する。
    /// `kind`は現状情報としてログに残すのみ。
    pub async fn add(
        &self,
        cluster: &str,
        address: &str,
        port: u32,
        check_alive: bool,
        kind: Option<&str>,
    ) {
        debug!(
            cluster = %cluster,
            address = %address,
            port = port,
            check_alive = check_alive,
            kind = kind.unwrap_or("-"),
            "Endpoint registration requested"
        );

        let key = EndpointKey::new(address, port);

        if check_alive {
            self.mark_pending(key.clone());
            self.scheduler
                .schedule(self.clone(), cluster.to_string(), key);
        } else {
            self.admit(cluster, key).await;
        }
    }

    /// endpointをクラスタ集合に反映し、射影を公開する
    ///
    /// 既に存在するキーは挿入をスキップする（冪等登録、バージョンも進まない）。
    pub(crate) async fn admit(&self, cluster: &str, key: EndpointKey) {
        let mut table = self.table.lock().await;

        let set = table.endpoints.entry(cluster.to_string()).or_default();
        if !set.insert(key.clone()) {
            debug!(cluster = %cluster, endpoint = %key, "Endpoint already exists");
            return;
        }
        let lb_endpoints: Vec<LbEndpoint> = set.iter().map(EndpointKey::to_lb_endpoint).collect();

        table.assignments.insert(
            cluster.to_string(),
            ClusterLoadAssignment::from_endpoints(cluster, lb_endpoints),
        );

        let assignments: Vec<ClusterLoadAssignment> =
            table.assignments.values().cloned().collect();
        self.store.update_endpoints_everywhere(assignments).await;

        info!(cluster = %cluster, endpoint = %key, "Endpoint added");
    }

    /// endpointを削除する
    ///
    /// probe中のendpointであればまずPendingProbeから外して取り消す。
    /// 実際に集合から取り除けた場合のみ射影を再計算して公開する。
    /// 存在しないendpoint/クラスタの削除は何もしない。
    pub async fn delete(&self, cluster: &str, address: &str, port: u32) {
        let key = EndpointKey::new(address, port);

        // 進行中のprobeを取り消す。probeループはadmit直前に再確認するため、
        // ここで外しておけば削除が必ず勝つ。
        self.clear_pending(&key);

        let mut table = self.table.lock().await;

        let Some(set) = table.endpoints.get_mut(cluster) else {
            debug!(cluster = %cluster, endpoint = %key, "Cluster not exist");
            return;
        };

        if !set.remove(&key) {
            debug!(cluster = %cluster, endpoint = %key, "Endpoint not exist");
            return;
        }
        let lb_endpoints: Vec<LbEndpoint> = set.iter().map(EndpointKey::to_lb_endpoint).collect();

        table.assignments.insert(
            cluster.to_string(),
            ClusterLoadAssignment::from_endpoints(cluster, lb_endpoints),
        );

        let assignments: Vec<ClusterLoadAssignment> =
            table.assignments.values().cloned().collect();
        self.store.update_endpoints_everywhere(assignments).await;

        info!(cluster = %cluster, endpoint = %key, "Endpoint removed");
    }

    /// 指定クラスタ群に対応するClusterLoadAssignmentを返す
    ///
    /// ConfigWatcherがグループスナップショット合成時にendpointを絞り込むために使う。
    pub async fn endpoints_for(
        &self,
        cluster_names: &HashSet<String>,
    ) -> Vec<ClusterLoadAssignment> {
        let table = self.table.lock().await;
        table
            .assignments
            .values()
            .filter(|cla| cluster_names.contains(&cla.cluster_name))
            .cloned()
            .collect()
    }

    /// 現在の射影全体を返す
    pub async fn assignments(&self) -> Vec<ClusterLoadAssignment> {
        let table = self.table.lock().await;
        table.assignments.values().cloned().collect()
    }

    /// 管理API向けに全endpointを`{cluster, address, port}`で列挙する
    pub async fn list(&self) -> Vec<EndpointInfo> {
        let table = self.table.lock().await;
        let mut list: Vec<EndpointInfo> = table
            .assignments
            .values()
            .flat_map(|cla| {
                cla.lb_endpoints().map(|lb| {
                    let sa = &lb.endpoint.address.socket_address;
                    EndpointInfo {
                        cluster: cla.cluster_name.clone(),
                        address: sa.address.clone(),
                        port: sa.port_value,
                    }
                })
            })
            .collect();
        list.sort_by(|a, b| {
            (&a.cluster, &a.address, a.port).cmp(&(&b.cluster, &b.address, b.port))
        });
        list
    }

    /// keyをPendingProbe集合に入れる
    pub(crate) fn mark_pending(&self, key: EndpointKey) {
        self.pending.lock().expect("pending probe lock poisoned").insert(key);
    }

    /// keyがPendingProbe集合に残っているか
    pub(crate) fn is_probe_pending(&self, key: &EndpointKey) -> bool {
        self.pending.lock().expect("pending probe lock poisoned").contains(key)
    }

    /// keyをPendingProbe集合から取り除き、残っていたかを返す
    ///
    /// probeループがadmit直前に呼ぶ。falseなら並行するDeleteに取り消されている。
    pub(crate) fn take_pending(&self, key: &EndpointKey) -> bool {
        self.pending.lock().expect("pending probe lock poisoned").remove(key)
    }

    /// keyをPendingProbe集合から取り除く（残っていなくても何もしない）
    pub(crate) fn clear_pending(&self, key: &EndpointKey) {
        self.pending.lock().expect("pending probe lock poisoned").remove(key);
    }
}
