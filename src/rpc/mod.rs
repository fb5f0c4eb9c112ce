//! RPC link between gateway instances and the rate limiter.
//!
//! Frames are length-delimited JSON documents. Every request carries an id that
//! the matching response echoes, so one connection serves many concurrent calls.

pub mod client;
pub mod link;
pub mod server;

use crate::error::{GatewayError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

pub use client::RpcClient;
pub use link::{Admission, LimiterLink};
pub use server::RpcServer;

/// Largest accepted frame
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Admission request for one API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficConReq {
    #[serde(rename = "ApiID")]
    pub api_id: String,
    #[serde(rename = "StrategyID")]
    pub strategy_id: i64,
    #[serde(rename = "ParamVal", default)]
    pub param_val: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficConRes {
    #[serde(rename = "Suc")]
    pub suc: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcCall {
    IncApiRate(TrafficConReq),
    DecApiRate(TrafficConReq),
    Ping(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    Rate(TrafficConRes),
    Pong(i64),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub call: RpcCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub reply: RpcReply,
}

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub(crate) fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame)
        .map_err(|e| GatewayError::Rpc(format!("Malformed frame: {}", e)))
}
