//! Transport contracts consumed by the replica sender.
//!
//! The sender is transport-agnostic; concrete implementations can use gRPC,
//! in-memory channels, or test harnesses.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use holo_batch::{BatchRequest, BatchResponse};

/// Connectivity of a client connection, as tracked by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Ready => "READY",
            ConnectionState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectionState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// A client connection to one node.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn state(&self) -> ConnectionState;

    /// Resolve once the state differs from `current`, returning the new state.
    async fn wait_for_state_change(
        &self,
        current: ConnectionState,
    ) -> anyhow::Result<ConnectionState>;

    /// Execute `ba` on the node.
    async fn batch(&self, ba: BatchRequest) -> anyhow::Result<BatchResponse>;
}

/// Source of connections, keyed by node address.
pub trait Transport: Send + Sync + 'static {
    /// Return a (possibly shared, possibly still connecting) connection to
    /// `addr`. Fails only when the address cannot be dialed at all.
    fn dial(&self, addr: &str) -> anyhow::Result<Arc<dyn Connection>>;
}

/// In-process batch handler of the local node.
#[async_trait]
pub trait LocalServer: Send + Sync + 'static {
    async fn batch(&self, ba: BatchRequest) -> anyhow::Result<BatchResponse>;
}

/// Transport plus the optional local server that short-circuits calls to
/// this node's own address.
pub struct RpcContext {
    transport: Arc<dyn Transport>,
    local: RwLock<Option<LocalEntry>>,
}

struct LocalEntry {
    addr: String,
    server: Arc<dyn LocalServer>,
}

impl RpcContext {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            local: RwLock::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Register the server reachable in-process at `addr`.
    pub fn set_local_server(&self, addr: impl Into<String>, server: Arc<dyn LocalServer>) {
        let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
        *local = Some(LocalEntry {
            addr: addr.into(),
            server,
        });
    }

    pub fn clear_local_server(&self) {
        let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
        *local = None;
    }

    /// The local server, if one is registered for `addr`.
    pub fn local_server(&self, addr: &str) -> Option<Arc<dyn LocalServer>> {
        let local = self.local.read().unwrap_or_else(PoisonError::into_inner);
        let entry = local.as_ref()?;
        (entry.addr == addr).then(|| Arc::clone(&entry.server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoTransport;

    impl Transport for NoTransport {
        fn dial(&self, addr: &str) -> anyhow::Result<Arc<dyn Connection>> {
            anyhow::bail!("cannot dial {addr}")
        }
    }

    struct Echo;

    #[async_trait]
    impl LocalServer for Echo {
        async fn batch(&self, _ba: BatchRequest) -> anyhow::Result<BatchResponse> {
            Ok(BatchResponse::new())
        }
    }

    #[test]
    fn local_server_matches_registered_address_only() {
        let ctx = RpcContext::new(Arc::new(NoTransport));
        assert!(ctx.local_server("n1").is_none());
        ctx.set_local_server("n1", Arc::new(Echo));
        assert!(ctx.local_server("n1").is_some());
        assert!(ctx.local_server("n2").is_none());
        ctx.clear_local_server();
        assert!(ctx.local_server("n1").is_none());
        assert!(ctx.transport().dial("n1").is_err());
    }
}
