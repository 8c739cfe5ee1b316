//! 型定義

/// Envoyリソースモデル（Bootstrap / Cluster / Listener / Secret等）
pub mod resource;

/// エンドポイント識別子
pub mod endpoint;

pub use endpoint::{EndpointInfo, EndpointKey};
pub use resource::{
    Address, Bootstrap, Cluster, ClusterLoadAssignment, LbEndpoint, Listener,
    LocalityLbEndpoints, RouteConfiguration, Secret, SocketAddress, StaticResources,
};
