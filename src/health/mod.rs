//! ヘルスチェック
//!
//! health gate付きで登録されたendpointに対して、反映前の生存確認probeを
//! 行う。probeはendpointごとに独立したタスクで実行し、PendingProbe集合の
//! メンバーシップを協調的キャンセルのシグナルとして使う。

use crate::registry::EndpointRegistry;
use crate::types::EndpointKey;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 1回のprobeの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// endpointが応答した（HTTPステータスは問わない）
    Up(u16),
    /// まだ起動していないとみなす応答（接続失敗 or ゲートウェイ系エラー）
    NotYetUp(Option<u16>),
}

/// probe実行の抽象
///
/// テストではこのtraitを差し替えてタイミングを制御する。
#[async_trait]
pub trait Prober: Send + Sync {
    /// endpointを1回probeする
    async fn probe(&self, key: &EndpointKey) -> ProbeOutcome;
}

/// HTTP GETによるprober
///
/// `http://{address}:{port}/`にGETを送り、応答の有無で判定する。
/// 502/503/504は起動途中のプロキシ/ゲートウェイからの応答とみなして
/// NotYetUp扱い。それ以外は4xxでも「生きている」と判定する。
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    /// タイムアウトを指定してproberを作成
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, key: &EndpointKey) -> ProbeOutcome {
        let url = format!("http://{}:{}/", key.address, key.port);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match status {
                    502 | 503 | 504 => ProbeOutcome::NotYetUp(Some(status)),
                    _ => ProbeOutcome::Up(status),
                }
            }
            Err(err) => {
                debug!(endpoint = %key, error = %err, "Probe request failed");
                ProbeOutcome::NotYetUp(None)
            }
        }
    }
}

/// probeタスクのスケジューラ
///
/// endpointごとに1タスクをspawnし、成功・キャンセル・試行上限のいずれかで
/// 終了する。終了時には必ずPendingProbe集合からkeyが消えている。
#[derive(Clone)]
pub struct ProbeScheduler {
    prober: Arc<dyn Prober>,
    interval: Duration,
    max_attempts: u32,
}

impl ProbeScheduler {
    /// 新しいスケジューラを作成
    pub fn new(prober: Arc<dyn Prober>, interval: Duration, max_attempts: u32) -> Self {
        Self {
            prober,
            interval,
            max_attempts,
        }
    }

    /// endpointのprobeループを開始する
    ///
    /// 呼び出し前にkeyがPendingProbe集合へ入っていることが前提。
    pub fn schedule(&self, registry: EndpointRegistry, cluster: String, key: EndpointKey) {
        let prober = Arc::clone(&self.prober);
        let interval = self.interval;
        let max_attempts = self.max_attempts;

        tokio::spawn(async move {
            run_probe_loop(registry, cluster, key, prober, interval, max_attempts).await;
        });
    }
}

async fn run_probe_loop(
    registry: EndpointRegistry,
    cluster: String,
    key: EndpointKey,
    prober: Arc<dyn Prober>,
    interval: Duration,
    max_attempts: u32,
) {
    for attempt in 1..=max_attempts {
        // Deleteに取り消されていたら即終了
        if !registry.is_probe_pending(&key) {
            debug!(cluster = %cluster, endpoint = %key, "Probe canceled");
            return;
        }

        match prober.probe(&key).await {
            ProbeOutcome::Up(status) => {
                // probe実行中にDeleteが来ていないか、admit直前に再確認する。
                // keyを取り除けなかった場合は削除が勝ち、反映しない。
                if registry.take_pending(&key) {
                    registry.admit(&cluster, key.clone()).await;
                    info!(
                        cluster = %cluster,
                        endpoint = %key,
                        status = status,
                        attempt = attempt,
                        "Probe succeeded"
                    );
                } else {
                    debug!(cluster = %cluster, endpoint = %key, "Probe canceled before admit");
                }
                return;
            }
            ProbeOutcome::NotYetUp(status) => {
                debug!(
                    cluster = %cluster,
                    endpoint = %key,
                    status = status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                    attempt = attempt,
                    max_attempts = max_attempts,
                    "Endpoint not yet up"
                );
            }
        }

        tokio::time::sleep(interval).await;
    }

    warn!(
        cluster = %cluster,
        endpoint = %key,
        max_attempts = max_attempts,
        "Probe attempts exhausted, endpoint not admitted"
    );
    registry.clear_pending(&key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointRegistry;
    use crate::snapshot::SnapshotStore;
    use tokio::sync::Semaphore;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// probe実行をテスト側から解放できるprober
    struct GatedProber {
        gate: Arc<Semaphore>,
        outcome: ProbeOutcome,
    }

    #[async_trait]
    impl Prober for GatedProber {
        async fn probe(&self, _key: &EndpointKey) -> ProbeOutcome {
            let _permit = self.gate.acquire().await.expect("gate closed");
            self.outcome
        }
    }

    struct AlwaysDown;

    #[async_trait]
    impl Prober for AlwaysDown {
        async fn probe(&self, _key: &EndpointKey) -> ProbeOutcome {
            ProbeOutcome::NotYetUp(Some(503))
        }
    }

    fn registry_with(prober: Arc<dyn Prober>, max_attempts: u32) -> EndpointRegistry {
        let scheduler = ProbeScheduler::new(prober, Duration::from_millis(5), max_attempts);
        EndpointRegistry::new(SnapshotStore::new(), scheduler)
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn test_http_prober_retries_until_server_is_up() {
        let server = MockServer::start().await;
        // 最初の2回は503、その後200を返す
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let addr = server.address();
        let prober = Arc::new(HttpProber::new(Duration::from_secs(1)));
        let registry = registry_with(prober, 10);

        registry
            .add("web", &addr.ip().to_string(), addr.port() as u32, true, None)
            .await;

        let mut admitted = false;
        for _ in 0..200 {
            if registry.list().await.len() == 1 {
                admitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(admitted, "endpoint should be admitted after retries");

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].port, addr.port() as u32);
        let key = EndpointKey::new(addr.ip().to_string(), addr.port() as u32);
        assert!(!registry.is_probe_pending(&key));
    }

    #[tokio::test]
    async fn test_http_prober_treats_4xx_as_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let addr = server.address();
        let prober = HttpProber::new(Duration::from_secs(1));
        let key = EndpointKey::new(addr.ip().to_string(), addr.port() as u32);

        assert_eq!(prober.probe(&key).await, ProbeOutcome::Up(404));
    }

    #[tokio::test]
    async fn test_http_prober_connection_failure_is_not_yet_up() {
        // 到達できないポート
        let prober = HttpProber::new(Duration::from_millis(200));
        let key = EndpointKey::new("127.0.0.1", 1);

        assert_eq!(prober.probe(&key).await, ProbeOutcome::NotYetUp(None));
    }

    #[tokio::test]
    async fn test_delete_during_probe_wins_over_admit() {
        let gate = Arc::new(Semaphore::new(0));
        let prober = Arc::new(GatedProber {
            gate: Arc::clone(&gate),
            outcome: ProbeOutcome::Up(200),
        });
        let registry = registry_with(prober, 10);

        // probeはgateで待たされる
        registry.add("web", "10.0.0.1", 8080, true, None).await;
        let key = EndpointKey::new("10.0.0.1", 8080);
        assert!(registry.is_probe_pending(&key));

        // probe完了前に削除 → pendingから外れる
        registry.delete("web", "10.0.0.1", 8080).await;
        assert!(!registry.is_probe_pending(&key));

        // probeを解放。成功を返すがadmit直前の再確認で取り消しを検出する
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registry.list().await.is_empty(), "canceled endpoint must not appear");
    }

    #[tokio::test]
    async fn test_probe_exhaustion_clears_pending_without_admit() {
        let registry = registry_with(Arc::new(AlwaysDown), 3);

        registry.add("web", "10.0.0.1", 8080, true, None).await;
        let key = EndpointKey::new("10.0.0.1", 8080);

        let probe_registry = registry.clone();
        let probe_key = key.clone();
        wait_until(move || !probe_registry.is_probe_pending(&probe_key)).await;

        assert!(registry.list().await.is_empty());
        assert!(!registry.is_probe_pending(&key));
    }
}
