//! エンドポイント識別子
//!
//! 動的に登録されるendpointは`(address, port)`の組で同一性を判定する。
//! 他のメタデータが違っても同じaddress+portなら同一endpointとして扱う。

use crate::types::resource::{Address, EndpointAddress, LbEndpoint, SocketAddress};
use serde::{Deserialize, Serialize};

/// endpointの構造的な識別子
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    /// ホスト名 or IPアドレス
    pub address: String,
    /// ポート番号
    pub port: u32,
}

impl EndpointKey {
    /// 新しいEndpointKeyを作成
    pub fn new(address: impl Into<String>, port: u32) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Envoy形式のLbEndpointに変換する（protocol = TCP固定）
    pub fn to_lb_endpoint(&self) -> LbEndpoint {
        LbEndpoint {
            endpoint: EndpointAddress {
                address: Address {
                    socket_address: SocketAddress {
                        address: self.address.clone(),
                        port_value: self.port,
                        protocol: "TCP".to_string(),
                    },
                },
            },
        }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// 管理API向けのendpoint表示用ビュー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// 所属クラスタ名
    pub cluster: String,
    /// ホスト名 or IPアドレス
    pub address: String,
    /// ポート番号
    pub port: u32,
}
