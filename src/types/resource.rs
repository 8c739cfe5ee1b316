//! Envoyリソースモデル
//!
//! control-planeが配信するリソース（cluster / endpoint / listener / route / secret）の
//! 型付きサブセット。スナップショットの合成とEDS配信に必要なフィールドのみを
//! 明示的に持ち、解釈しないフィールドは`extra`にそのまま保持する。

use serde::{Deserialize, Serialize};

/// グループconfigファイルのルート構造
///
/// Envoy bootstrap形式のYAMLのうち`static_resources`のみを読み取る。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bootstrap {
    /// 静的リソース定義
    #[serde(default)]
    pub static_resources: StaticResources,
}

/// Bootstrap内の静的リソース
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticResources {
    /// クラスタ一覧
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    /// リスナー一覧
    #[serde(default)]
    pub listeners: Vec<Listener>,
    /// シークレット一覧
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

/// クラスタリソース
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// クラスタ名
    pub name: String,
    /// クラスタタイプ（STATIC / STRICT_DNS / EDS 等）
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub cluster_type: Option<String>,
    /// 接続タイムアウト（Envoy duration文字列）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<String>,
    /// ロードバランシングポリシー
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb_policy: Option<String>,
    /// 静的に定義されたload assignment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_assignment: Option<ClusterLoadAssignment>,
    /// 解釈しない残りのフィールド（そのまま保持して配信する）
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// リスナーリソース
///
/// filter chain等の内部構造はcontrol-planeでは解釈しない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    /// リスナー名
    pub name: String,
    /// 解釈しない残りのフィールド
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// シークレットリソース
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    /// シークレット名
    pub name: String,
    /// 解釈しない残りのフィールド
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// ルート設定リソース
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfiguration {
    /// ルート設定名
    pub name: String,
    /// 解釈しない残りのフィールド
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// クラスタのload assignment（クラスタ名とendpoint集合の対応）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLoadAssignment {
    /// 対象クラスタ名
    pub cluster_name: String,
    /// locality単位のendpoint一覧
    #[serde(default)]
    pub endpoints: Vec<LocalityLbEndpoints>,
}

impl ClusterLoadAssignment {
    /// クラスタ名とendpoint集合からload assignmentを合成する
    pub fn from_endpoints<I>(cluster_name: &str, endpoints: I) -> Self
    where
        I: IntoIterator<Item = LbEndpoint>,
    {
        Self {
            cluster_name: cluster_name.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: endpoints.into_iter().collect(),
            }],
        }
    }

    /// 保持している全LbEndpointをフラットに走査する
    pub fn lb_endpoints(&self) -> impl Iterator<Item = &LbEndpoint> {
        self.endpoints.iter().flat_map(|l| l.lb_endpoints.iter())
    }
}

/// locality単位のendpoint一覧
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalityLbEndpoints {
    /// ロードバランシング対象のendpoint一覧
    #[serde(default)]
    pub lb_endpoints: Vec<LbEndpoint>,
}

/// ロードバランシング対象のendpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbEndpoint {
    /// endpoint本体
    pub endpoint: EndpointAddress,
}

/// endpointのアドレス情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    /// アドレス
    pub address: Address,
}

/// アドレス（socket addressのみサポート）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// ソケットアドレス
    pub socket_address: SocketAddress,
}

/// ソケットアドレス
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketAddress {
    /// ホスト名 or IPアドレス
    pub address: String,
    /// ポート番号
    pub port_value: u32,
    /// トランスポートプロトコル
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}
