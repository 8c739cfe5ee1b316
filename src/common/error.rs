//! エラー型定義
//!
//! 統一エラー型（thiserror使用）
//!
//! 管理APIのハンドラーは`status_code()`でHTTPステータスに変換する。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// control-planeエラー型
#[derive(Debug, Error)]
pub enum CpError {
    /// 設定ディレクトリが存在しない or ディレクトリでない（起動時致命エラー）
    #[error("Configuration path is not a directory: {0}")]
    ConfigDirectory(String),

    /// configファイルのパースエラー（リロード全体を中断する）
    #[error("Failed to parse config file '{file}': {source}")]
    ConfigParse {
        /// 対象ファイル名
        file: String,
        /// パースエラー本体
        #[source]
        source: serde_yaml::Error,
    },

    /// I/Oエラー
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// グループが見つからない
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// バリデーションエラー
    #[error("Validation error: {0}")]
    Validation(String),

    /// 内部エラー
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CpError {
    /// HTTPステータスコードを返す
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConfigDirectory(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConfigParse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::GroupNotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CpError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// control-plane用Result型
pub type CpResult<T> = Result<T, CpError>;
