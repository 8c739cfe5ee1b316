//! discoveryストリーム境界
//!
//! xDSプロトコルエンジン（gRPCサーバ）との境界。エンジン側はスナップショット
//! storeを参照してリソースを配信し、ストリームのライフサイクルイベントを
//! このモジュールのコールバックに通知する。コールバック経由でendpointの
//! 自己登録・登録解除が行われる。

use crate::registry::EndpointRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// discoveryリクエスト（エンジンから渡されるプロトコルメッセージのサブセット）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// クライアントが最後に適用したバージョン
    #[serde(default)]
    pub version_info: String,
    /// リクエスト元ノード
    #[serde(default)]
    pub node: Option<Node>,
    /// 要求リソース名
    #[serde(default)]
    pub resource_names: Vec<String>,
    /// リソースタイプURL
    #[serde(default)]
    pub type_url: String,
    /// 応答中のnonce
    #[serde(default)]
    pub response_nonce: String,
    /// 直前の応答をNACKする場合のエラー詳細
    #[serde(default)]
    pub error_detail: Option<ErrorDetail>,
}

/// discoveryリクエスト元のノード情報
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    /// ノードID
    #[serde(default)]
    pub id: String,
    /// 所属node-group名
    #[serde(default)]
    pub cluster: String,
    /// ノードメタデータ（endpoint自己登録フィールドを含みうる）
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// NACKのエラー詳細
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// ステータスコード
    #[serde(default)]
    pub code: i32,
    /// エラーメッセージ
    #[serde(default)]
    pub message: String,
}

/// discoveryレスポンス（コールバック通知用のサブセット）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    /// 配信したスナップショットのバージョン
    #[serde(default)]
    pub version_info: String,
    /// リソースタイプURL
    #[serde(default)]
    pub type_url: String,
    /// 応答nonce
    #[serde(default)]
    pub nonce: String,
}

/// プロトコルエンジンのストリームライフサイクルコールバック
#[async_trait]
pub trait DiscoveryCallbacks: Send + Sync {
    /// ストリーム開始
    async fn on_stream_open(&self, stream_id: i64, type_url: &str);
    /// リクエスト受信
    async fn on_stream_request(&self, stream_id: i64, request: &DiscoveryRequest);
    /// レスポンス送信
    async fn on_stream_response(
        &self,
        stream_id: i64,
        request: &DiscoveryRequest,
        response: &DiscoveryResponse,
    );
    /// ストリーム正常終了
    async fn on_stream_close(&self, stream_id: i64, type_url: &str);
    /// ストリーム異常終了
    async fn on_stream_close_with_error(&self, stream_id: i64, type_url: &str, error: &str);
}

/// ストリームに紐づく登録情報
#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    cluster: String,
    address: String,
    port: u32,
}

/// ストリームセッション（最初のリクエストで確定する）
#[derive(Debug, Clone)]
struct StreamSession {
    group: String,
    node_id: String,
    registration: Option<Registration>,
}

/// ストリームライフサイクルの追跡とendpoint自己登録
///
/// ストリームごとに最初のリクエストでセッションを記録し、ノードメタデータに
/// 完全な登録情報（service / address / port）があればレジストリに登録する。
/// ストリーム終了時に対応する登録を解除する。
#[derive(Clone)]
pub struct StreamTracker {
    registry: EndpointRegistry,
    sessions: Arc<Mutex<HashMap<i64, StreamSession>>>,
}

impl StreamTracker {
    /// 新しいトラッカーを作成
    pub fn new(registry: EndpointRegistry) -> Self {
        Self {
            registry,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 現在追跡中のストリーム数（診断用）
    pub async fn active_streams(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn close_stream(&self, stream_id: i64) {
        let session = self.sessions.lock().await.remove(&stream_id);
        let Some(session) = session else {
            // 未知 or 既にクローズ済みのストリーム
            debug!(stream_id = stream_id, "Stream close for unknown session");
            return;
        };

        if let Some(reg) = session.registration {
            info!(
                stream_id = stream_id,
                cluster = %reg.cluster,
                address = %reg.address,
                port = reg.port,
                "Stream closed, deregistering endpoint"
            );
            self.registry
                .delete(&reg.cluster, &reg.address, reg.port)
                .await;
        } else {
            debug!(
                stream_id = stream_id,
                node_id = %session.node_id,
                group = %session.group,
                "Stream closed without endpoint registration"
            );
        }
    }
}

#[async_trait]
impl DiscoveryCallbacks for StreamTracker {
    async fn on_stream_open(&self, stream_id: i64, type_url: &str) {
        debug!(stream_id = stream_id, type_url = %type_url, "Stream opened");
    }

    async fn on_stream_request(&self, stream_id: i64, request: &DiscoveryRequest) {
        // NACK（エラー詳細付き）は登録イベントではない。セッションも作らない。
        if let Some(error) = &request.error_detail {
            warn!(
                stream_id = stream_id,
                code = error.code,
                message = %error.message,
                "Discovery request carried an error detail"
            );
            return;
        }

        let Some(node) = &request.node else {
            debug!(stream_id = stream_id, "Discovery request without node info");
            return;
        };

        let mut sessions = self.sessions.lock().await;
        // 最初のリクエストが勝つ。以降のリクエストでセッションは変わらない。
        if sessions.contains_key(&stream_id) {
            return;
        }

        let registration = registration_from_metadata(&node.metadata);
        sessions.insert(
            stream_id,
            StreamSession {
                group: node.cluster.clone(),
                node_id: node.id.clone(),
                registration: registration.clone(),
            },
        );
        drop(sessions);

        debug!(
            stream_id = stream_id,
            node_id = %node.id,
            group = %node.cluster,
            "Stream session recorded"
        );

        if let Some(reg) = registration {
            let check_alive = node
                .metadata
                .get("check_alive")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let kind = node
                .metadata
                .get("type")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            self.registry
                .add(
                    &reg.cluster,
                    &reg.address,
                    reg.port,
                    check_alive,
                    kind.as_deref(),
                )
                .await;
        }
    }

    async fn on_stream_response(
        &self,
        stream_id: i64,
        request: &DiscoveryRequest,
        response: &DiscoveryResponse,
    ) {
        debug!(
            stream_id = stream_id,
            type_url = %request.type_url,
            version = %response.version_info,
            "Discovery response sent"
        );
    }

    async fn on_stream_close(&self, stream_id: i64, type_url: &str) {
        debug!(stream_id = stream_id, type_url = %type_url, "Stream closed");
        self.close_stream(stream_id).await;
    }

    async fn on_stream_close_with_error(&self, stream_id: i64, type_url: &str, error: &str) {
        warn!(stream_id = stream_id, type_url = %type_url, error = %error, "Stream closed with error");
        self.close_stream(stream_id).await;
    }
}

/// ノードメタデータから登録情報を取り出す
///
/// `service` / `address`が空でなく、`port`が0でない数値の場合のみ完全な
/// 登録情報とみなす。どれか欠けていれば登録は行わない。
fn registration_from_metadata(
    metadata: &HashMap<String, serde_json::Value>,
) -> Option<Registration> {
    let service = metadata.get("service")?.as_str()?;
    let address = metadata.get("address")?.as_str()?;
    let port = metadata.get("port")?.as_u64()?;

    if service.is_empty() || address.is_empty() || port == 0 || port > u32::MAX as u64 {
        return None;
    }

    Some(Registration {
        cluster: service.to_string(),
        address: address.to_string(),
        port: port as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HttpProber, ProbeScheduler};
    use crate::snapshot::SnapshotStore;
    use serde_json::json;
    use std::time::Duration;

    fn test_tracker() -> (EndpointRegistry, StreamTracker) {
        let store = SnapshotStore::new();
        let scheduler = ProbeScheduler::new(
            Arc::new(HttpProber::new(Duration::from_millis(100))),
            Duration::from_millis(10),
            3,
        );
        let registry = EndpointRegistry::new(store, scheduler);
        let tracker = StreamTracker::new(registry.clone());
        (registry, tracker)
    }

    fn registration_request(service: &str, address: &str, port: u32) -> DiscoveryRequest {
        let mut metadata = HashMap::new();
        metadata.insert("service".to_string(), json!(service));
        metadata.insert("address".to_string(), json!(address));
        metadata.insert("port".to_string(), json!(port));
        DiscoveryRequest {
            node: Some(Node {
                id: "node-1".to_string(),
                cluster: "front-proxy".to_string(),
                metadata,
            }),
            type_url: "type.googleapis.com/envoy.config.cluster.v3.Cluster".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_request_registers_endpoint() {
        let (registry, tracker) = test_tracker();

        tracker.on_stream_open(1, "cds").await;
        tracker
            .on_stream_request(1, &registration_request("web", "10.0.0.1", 8080))
            .await;

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].cluster, "web");
        assert_eq!(tracker.active_streams().await, 1);
    }

    #[tokio::test]
    async fn test_first_request_wins_over_later_requests() {
        let (registry, tracker) = test_tracker();

        tracker
            .on_stream_request(1, &registration_request("web", "10.0.0.1", 8080))
            .await;
        // 同一ストリームの2通目は無視される
        tracker
            .on_stream_request(1, &registration_request("other", "10.0.0.9", 9999))
            .await;

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].cluster, "web");

        // クローズ時に解除されるのは最初の登録
        tracker.on_stream_close(1, "cds").await;
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_error_detail_request_is_not_a_registration() {
        let (registry, tracker) = test_tracker();

        let mut request = registration_request("web", "10.0.0.1", 8080);
        request.error_detail = Some(ErrorDetail {
            code: 13,
            message: "nack".to_string(),
        });

        tracker.on_stream_request(1, &request).await;

        assert!(registry.list().await.is_empty());
        // セッションも記録されない
        assert_eq!(tracker.active_streams().await, 0);
    }

    #[tokio::test]
    async fn test_incomplete_metadata_records_session_without_registration() {
        let (registry, tracker) = test_tracker();

        // portが無い
        let mut metadata = HashMap::new();
        metadata.insert("service".to_string(), json!("web"));
        metadata.insert("address".to_string(), json!("10.0.0.1"));
        let request = DiscoveryRequest {
            node: Some(Node {
                id: "node-2".to_string(),
                cluster: "front-proxy".to_string(),
                metadata,
            }),
            ..Default::default()
        };

        tracker.on_stream_request(7, &request).await;

        assert!(registry.list().await.is_empty());
        assert_eq!(tracker.active_streams().await, 1);

        // 登録のないセッションのクローズはdeleteを呼ばない（endpointなしのまま）
        tracker.on_stream_close(7, "cds").await;
        assert_eq!(tracker.active_streams().await, 0);
    }

    #[tokio::test]
    async fn test_zero_port_is_rejected() {
        let (registry, tracker) = test_tracker();
        tracker
            .on_stream_request(1, &registration_request("web", "10.0.0.1", 0))
            .await;
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_close_is_idempotent() {
        let (registry, tracker) = test_tracker();

        tracker
            .on_stream_request(1, &registration_request("web", "10.0.0.1", 8080))
            .await;
        tracker.on_stream_close(1, "cds").await;
        assert!(registry.list().await.is_empty());

        // 二重クローズは何も起きない
        tracker.on_stream_close(1, "cds").await;
        assert_eq!(tracker.active_streams().await, 0);
    }

    #[tokio::test]
    async fn test_stream_error_close_also_deregisters() {
        let (registry, tracker) = test_tracker();

        tracker
            .on_stream_request(2, &registration_request("api", "10.0.0.2", 9090))
            .await;
        tracker
            .on_stream_close_with_error(2, "cds", "connection reset")
            .await;

        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_check_alive_metadata_defers_admission() {
        let (registry, tracker) = test_tracker();

        let mut request = registration_request("web", "10.0.0.1", 8080);
        if let Some(node) = &mut request.node {
            node.metadata.insert("check_alive".to_string(), json!(true));
        }

        tracker.on_stream_request(1, &request).await;

        // probe成功までは反映されない
        assert!(registry.list().await.is_empty());
        let key = crate::types::EndpointKey::new("10.0.0.1", 8080);
        assert!(registry.is_probe_pending(&key));
    }
}
