use super::{codec, decode, encode, RpcCall, RpcReply, RpcRequest, RpcResponse, TrafficConReq};
use crate::error::{GatewayError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Pending = Arc<DashMap<u64, oneshot::Sender<RpcReply>>>;

/// Multiplexed connection to the rate limiter.
///
/// Calls are matched to responses by id. When the connection breaks every
/// pending call fails and the client stays closed.
pub struct RpcClient {
    addr: String,
    next_id: AtomicU64,
    pending: Pending,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    timeout: Duration,
}

impl RpcClient {
    /// Dial `addr`; both dialing and every later call are bounded by `timeout`
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| GatewayError::Rpc(format!("Dialing {} timed out", addr)))?
            .map_err(|e| GatewayError::Rpc(format!("Failed to dial {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let (mut sink, mut frames) = Framed::new(stream, codec()).split();
        let (outbound, mut rx) = mpsc::channel::<Bytes>(1024);
        let closed = CancellationToken::new();
        let pending: Pending = Arc::new(DashMap::new());

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                debug!(error = %e, "RPC write failed");
                                writer_closed.cancel();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = sink.close().await;
        });

        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        let peer = addr.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = frames.next() => match frame {
                        Some(Ok(frame)) => match decode::<RpcResponse>(&frame) {
                            Ok(res) => {
                                if let Some((_, tx)) = reader_pending.remove(&res.id) {
                                    let _ = tx.send(res.reply);
                                }
                            }
                            Err(e) => warn!(peer = %peer, error = %e, "Dropping RPC response"),
                        },
                        Some(Err(e)) => {
                            debug!(peer = %peer, error = %e, "RPC read failed");
                            break;
                        }
                        None => {
                            debug!(peer = %peer, "RPC connection closed by peer");
                            break;
                        }
                    }
                }
            }
            reader_closed.cancel();
            // Dropping the senders fails every waiting call
            reader_pending.clear();
        });

        Ok(Self {
            addr: addr.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            closed,
            timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send one call and wait for its reply
    pub async fn call(&self, call: RpcCall) -> Result<RpcReply> {
        if self.is_closed() {
            return Err(GatewayError::Rpc("Connection closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode(&RpcRequest { id, call })?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self.is_closed() {
            self.pending.remove(&id);
            return Err(GatewayError::Rpc("Connection closed".to_string()));
        }

        let exchange = async {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| GatewayError::Rpc("Connection closed".to_string()))?;
            rx.await
                .map_err(|_| GatewayError::Rpc("Connection closed".to_string()))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(RpcReply::Error(msg))) => Err(GatewayError::Rpc(msg)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.pending.remove(&id);
                Err(e)
            }
            Err(_) => {
                self.pending.remove(&id);
                Err(GatewayError::Rpc(format!(
                    "Call timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    pub async fn inc_api_rate(&self, req: TrafficConReq) -> Result<bool> {
        match self.call(RpcCall::IncApiRate(req)).await? {
            RpcReply::Rate(res) => Ok(res.suc),
            other => Err(unexpected(other)),
        }
    }

    pub async fn dec_api_rate(&self, req: TrafficConReq) -> Result<bool> {
        match self.call(RpcCall::DecApiRate(req)).await? {
            RpcReply::Rate(res) => Ok(res.suc),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> Result<i64> {
        match self.call(RpcCall::Ping(0)).await? {
            RpcReply::Pong(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    /// Close the connection and fail pending calls
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn unexpected(reply: RpcReply) -> GatewayError {
    GatewayError::Rpc(format!("Unexpected reply: {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = RpcClient::connect(&addr, Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        // Accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let client = RpcClient::connect(&addr, Duration::from_millis(200))
            .await
            .unwrap();
        let start = std::time::Instant::now();
        assert!(client.ping().await.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));

        server.abort();
    }

    #[tokio::test]
    async fn test_peer_close_fails_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let client = RpcClient::connect(&addr, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(client.ping().await.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.is_closed());
    }
}
