//! Broker-backed clients for downstream services

pub mod rpc_client;

pub use rpc_client::{RetryPolicy, RpcClient, RpcError};
