//! Configuration management via environment variables
//!
//! Provides helper functions for reading `XDSCP_*` environment variables
//! with typed parsing and defaults.

use std::time::Duration;

/// Get an environment variable, or a default value if unset
pub fn get_env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Get an environment variable, parsing to a specific type
///
/// Returns the default when the variable is unset or fails to parse.
pub fn get_env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// ヘルスチェックprobeの設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// probeのリトライ間隔
    pub interval: Duration,
    /// 最大試行回数
    pub max_attempts: u32,
    /// 1回のprobeのHTTPタイムアウト
    pub timeout: Duration,
}

impl ProbeConfig {
    /// Load probe configuration from environment variables.
    pub fn from_env() -> Self {
        let interval_secs = get_env_parse("XDSCP_HEALTHCHECK_INTERVAL_SECS", 10u64);
        let max_attempts = get_env_parse("XDSCP_HEALTHCHECK_MAX_ATTEMPTS", 50u32);
        let timeout_secs = get_env_parse("XDSCP_HEALTHCHECK_TIMEOUT_SECS", 3u64);

        Self {
            interval: Duration::from_secs(interval_secs),
            max_attempts,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// 全グループにマージされるdefaultグループ名を取得
///
/// 環境変数 `XDSCP_DEFAULT_GROUP` から取得し、未設定の場合は `default` を返す。
pub fn get_default_group() -> String {
    get_env_or("XDSCP_DEFAULT_GROUP", "default")
}

/// configディレクトリ監視のポーリング間隔を取得
///
/// 環境変数 `XDSCP_WATCH_INTERVAL_SECS` から取得し、未設定の場合は5秒を使用する。
pub fn get_watch_interval() -> Duration {
    Duration::from_secs(get_env_parse("XDSCP_WATCH_INTERVAL_SECS", 5u64))
}
