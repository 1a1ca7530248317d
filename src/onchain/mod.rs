//! On-chain AMM price sources: chain metadata, the JSON-RPC reader, and
//! the pool polling adapter.

pub mod chains;
pub mod poller;
pub mod rpc;

pub use chains::{chain_by_slug, ChainConfig, CHAINS};
pub use poller::PoolAdapter;
pub use rpc::EvmRpcClient;
