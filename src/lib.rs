//! Envoy xDS control plane
//!
//! 静的なグループ別YAML configと、discoveryストリーム経由で動的に
//! 自己登録されるendpointを組み合わせてスナップショットを配信する
//! control-planeコア。

#![warn(missing_docs)]

/// 共通型定義
pub mod common;

/// 管理REST APIハンドラー
pub mod api;

/// 設定管理（環境変数ヘルパー）
pub mod config;

/// discoveryストリーム境界（コールバック・セッション追跡）
pub mod discovery;

/// endpointヘルスチェック
pub mod health;

/// ロギング初期化ユーティリティ
pub mod logging;

/// エンドポイント登録管理
pub mod registry;

/// 管理サーバの起動
pub mod server;

/// node-group別スナップショット管理
pub mod snapshot;

/// Envoyリソースモデル
pub mod types;

/// configディレクトリの読み込みと監視
pub mod watcher;

use discovery::StreamTracker;
use registry::EndpointRegistry;
use snapshot::SnapshotStore;
use watcher::ConfigWatcher;

/// アプリケーション全体の共有状態
#[derive(Clone)]
pub struct AppState {
    /// node-group別スナップショットstore
    pub snapshots: SnapshotStore,
    /// エンドポイントレジストリ
    pub registry: EndpointRegistry,
    /// config watcher
    pub watcher: ConfigWatcher,
    /// discoveryストリームトラッカー
    pub tracker: StreamTracker,
}
