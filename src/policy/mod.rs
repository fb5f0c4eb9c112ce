//! API definitions and strategies: store access, decoding and the shared cache.

pub mod cache;
pub mod model;
pub mod store;

pub use cache::{CacheScope, PolicyCache, PolicyRefresher, PolicySnapshot};
pub use model::{
    AddrType, ApiDefinition, ApiRecord, ApiStatus, BwEntry, BwMode, BwStrategy, MatchKind,
    RetryStrategy, RouteType, Strategy, StrategyDetail, StrategyRecord, StrategyStatus,
    StrategyType, TrafficStrategy,
};
pub use store::{FilePolicyStore, MemoryPolicyStore, PolicyBatch, PolicyStore};
