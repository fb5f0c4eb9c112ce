use super::{codec, decode, encode, RpcRequest, RpcResponse};
use crate::error::Result;
use crate::rate_limit::RateLimiterService;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// RPC endpoint of the rate limiter process
pub struct RpcServer {
    listener: TcpListener,
    service: Arc<RateLimiterService>,
}

impl RpcServer {
    pub async fn bind(addr: &str, service: Arc<RateLimiterService>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires; open connections are closed too
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "Rate limiter RPC server listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Rate limiter RPC server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Gateway connected");
                        let service = self.service.clone();
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            serve_connection(stream, peer, service, conn_cancel).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept RPC connection"),
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<RateLimiterService>,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (mut sink, mut frames) = Framed::new(stream, codec()).split();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(peer = %peer, error = %e, "RPC read failed");
                break;
            }
            None => break,
        };

        let response = match decode::<RpcRequest>(&frame) {
            Ok(req) => RpcResponse {
                id: req.id,
                reply: service.handle(req.call),
            },
            Err(e) => {
                warn!(peer = %peer, error = %e, "Closing connection after malformed request");
                break;
            }
        };

        let bytes = match encode(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to encode RPC response");
                continue;
            }
        };

        if let Err(e) = sink.send(bytes).await {
            debug!(peer = %peer, error = %e, "RPC write failed");
            break;
        }
    }

    debug!(peer = %peer, "Gateway disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{CacheScope, PolicyCache};
    use crate::rpc::{RpcClient, TrafficConReq};
    use std::time::Duration;

    #[tokio::test]
    async fn test_ping_and_inc_over_tcp() {
        let cache = Arc::new(PolicyCache::new(CacheScope::StrategiesOnly));
        let service = Arc::new(RateLimiterService::new(cache));
        let server = RpcServer::bind("127.0.0.1:0", service).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.serve(cancel.clone()));

        let client = RpcClient::connect(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(client.ping().await.unwrap(), 1);

        let allowed = client
            .inc_api_rate(TrafficConReq {
                api_id: "order.v1".to_string(),
                strategy_id: 0,
                param_val: String::new(),
            })
            .await
            .unwrap();
        assert!(allowed);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
