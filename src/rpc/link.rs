use super::client::RpcClient;
use super::TrafficConReq;
use crate::config::LimiterConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Admission control as seen by the filter chain
#[async_trait]
pub trait Admission: Send + Sync {
    /// Count one call; `Ok(false)` means refused
    async fn inc_api_rate(&self, req: TrafficConReq) -> Result<bool>;

    /// Release one concurrency slot
    async fn dec_api_rate(&self, req: TrafficConReq) -> Result<()>;
}

/// Gateway side of the limiter connection, kept alive by a supervisor task
pub struct LimiterLink {
    addr: String,
    rpc_timeout: Duration,
    ping_interval: Duration,
    redial_initial: Duration,
    redial_max: Duration,
    client: RwLock<Option<Arc<RpcClient>>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl LimiterLink {
    /// Dial the limiter and check it answers. Failing here is fatal for the gateway.
    pub async fn connect(config: &LimiterConfig) -> Result<Arc<Self>> {
        let client = RpcClient::connect(&config.addr, config.rpc_timeout()).await?;
        let pong = client.ping().await?;
        if pong != 1 {
            return Err(GatewayError::Rpc(format!(
                "Rate limiter at {} answered ping with {}",
                config.addr, pong
            )));
        }

        info!(addr = %config.addr, "Connected to rate limiter");

        Ok(Arc::new(Self {
            addr: config.addr.clone(),
            rpc_timeout: config.rpc_timeout(),
            ping_interval: config.ping_interval(),
            redial_initial: config.redial_initial(),
            redial_max: config.redial_max(),
            client: RwLock::new(Some(Arc::new(client))),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }))
    }

    /// Whether admission calls currently have a live connection
    pub fn is_connected(&self) -> bool {
        self.live_client().is_some()
    }

    fn live_client(&self) -> Option<Arc<RpcClient>> {
        self.client
            .read()
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Start the liveness probe
    pub fn spawn_supervisor(self: &Arc<Self>) {
        let link = self.clone();
        let handle = tokio::spawn(async move { link.supervise().await });

        if let Some(old) = self.supervisor.lock().replace(handle) {
            old.abort();
            warn!("Aborted previous limiter link supervisor");
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Limiter link supervisor received cancel signal");
                    break;
                }
                _ = ticker.tick() => {
                    if self.probe().await {
                        continue;
                    }

                    warn!(addr = %self.addr, "Rate limiter link lost, redialing");
                    if let Some(client) = self.client.write().take() {
                        client.close();
                    }

                    if !self.redial().await {
                        break;
                    }
                    ticker.reset();
                }
            }
        }
    }

    async fn probe(&self) -> bool {
        match self.live_client() {
            Some(client) => match client.ping().await {
                Ok(1) => true,
                Ok(other) => {
                    warn!(pong = other, "Unexpected ping reply from rate limiter");
                    false
                }
                Err(e) => {
                    debug!(error = %e, "Rate limiter ping failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Redial until it works; `false` if cancelled first
    async fn redial(&self) -> bool {
        let mut backoff = self.redial_backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match RpcClient::connect(&self.addr, self.rpc_timeout).await {
                Ok(client) => match client.ping().await {
                    Ok(1) => {
                        *self.client.write() = Some(Arc::new(client));
                        info!(addr = %self.addr, attempt, "Reconnected to rate limiter");
                        return true;
                    }
                    Ok(other) => warn!(pong = other, "Unexpected ping reply from rate limiter"),
                    Err(e) => debug!(attempt, error = %e, "Redial ping failed"),
                },
                Err(e) => debug!(attempt, error = %e, "Redial failed"),
            }

            let wait = backoff.next_backoff().unwrap_or(self.redial_max);
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn redial_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.redial_initial)
            .with_max_interval(self.redial_max)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Stop the supervisor and close the connection
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        if let Some(client) = self.client.write().take() {
            client.close();
        }
    }
}

#[async_trait]
impl Admission for LimiterLink {
    async fn inc_api_rate(&self, req: TrafficConReq) -> Result<bool> {
        let client = self
            .live_client()
            .ok_or_else(|| GatewayError::Rpc("Rate limiter link is down".to_string()))?;
        client.inc_api_rate(req).await
    }

    async fn dec_api_rate(&self, req: TrafficConReq) -> Result<()> {
        let client = self
            .live_client()
            .ok_or_else(|| GatewayError::Rpc("Rate limiter link is down".to_string()))?;
        client.dec_api_rate(req).await.map(|_| ())
    }
}
