//! ロギング初期化ユーティリティ

use tracing_subscriber::EnvFilter;

/// tracingサブスクライバを初期化する
///
/// `RUST_LOG`が設定されていればそれを使い、未設定なら`xdscp=info`を使う。
/// 二重初期化はエラーを返す。
pub fn init() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xdscp=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    Ok(())
}
