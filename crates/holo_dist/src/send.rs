//! Multi-replica RPC sender.
//!
//! Sends one batch to the replicas of a single range: one replica at a time,
//! moving on to the next when the pending one fails or does not answer
//! within the send-next timeout. Earlier attempts are never cancelled; the
//! first successful reply wins and stragglers are dropped.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use holo_batch::{BatchRequest, BatchResponse, KvError};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use crate::replica::{ReplicaInfo, ReplicaSlice};
use crate::stats::SenderStats;
use crate::transport::{Connection, ConnectionState, RpcContext};

/// Order in which replicas are tried.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderingPolicy {
    /// Keep the order of the replica slice.
    Stable,
    /// Shuffle, trying replicas with a ready connection first.
    #[default]
    Random,
}

/// Per-call options of the replica sender.
#[derive(Clone, Copy, Debug)]
pub struct SendOptions {
    pub ordering: OrderingPolicy,
    /// Dispatch to the next replica when no reply arrived within this delay.
    pub send_next_timeout: Duration,
    /// Bound on each replica attempt; `Duration::ZERO` disables it.
    pub timeout: Duration,
}

/// Sends a single-range batch to a set of replicas.
#[async_trait]
pub trait RpcSend: Send + Sync + 'static {
    async fn send(
        &self,
        opts: SendOptions,
        replicas: ReplicaSlice,
        ba: BatchRequest,
    ) -> Result<BatchResponse, KvError>;
}

struct Target {
    info: ReplicaInfo,
    conn: Arc<dyn Connection>,
}

type Completion = anyhow::Result<BatchResponse>;

/// `RpcSend` over a `Transport`, with an in-process fast path for replicas
/// on the local node.
pub struct ReplicaSender {
    rpc: Arc<RpcContext>,
    enable_local_calls: bool,
    stats: Arc<SenderStats>,
}

impl ReplicaSender {
    pub fn new(rpc: Arc<RpcContext>, enable_local_calls: bool, stats: Arc<SenderStats>) -> Self {
        Self {
            rpc,
            enable_local_calls,
            stats,
        }
    }

    /// Spawn one attempt against `target`, reporting into `done`.
    ///
    /// Inputs:
    /// - `ba`: copied and addressed to the target replica.
    /// - `timeout`: per-attempt bound; zero disables it.
    ///
    /// Output:
    /// - One `Completion` on `done`, unless every receiver is gone by then.
    fn dispatch(
        &self,
        target: Target,
        ba: &BatchRequest,
        timeout: Duration,
        done: &mpsc::Sender<Completion>,
    ) {
        let mut ba = ba.clone();
        ba.header.replica = Some(target.info.replica);
        let local = if self.enable_local_calls {
            self.rpc.local_server(target.info.address())
        } else {
            None
        };
        self.stats.record_rpc(local.is_some());

        let addr = target.info.address().to_string();
        let span = tracing::debug_span!(
            "replica_rpc",
            addr = %addr,
            replica = %target.info.replica,
            local = local.is_some()
        );
        let done = done.clone();
        tokio::spawn(
            async move {
                let result = match local {
                    Some(server) => with_timeout(timeout, &addr, server.batch(ba)).await,
                    None => with_timeout(timeout, &addr, call(target.conn, &addr, ba)).await,
                };
                // The receiver is gone once another replica answered.
                let _ = done.send(result).await;
            }
            .instrument(span),
        );
    }
}

#[async_trait]
impl RpcSend for ReplicaSender {
    /// Race `ba` across `replicas` until one of them answers.
    ///
    /// Inputs:
    /// - `opts.ordering`: `Stable` keeps the caller's order; `Random` shuffles
    ///   ready connections ahead of the rest.
    /// - `opts.send_next_timeout`: delay before the next replica is tried
    ///   while earlier attempts are still in flight.
    /// - `opts.timeout`: bound on each replica's readiness wait plus call.
    /// - `replicas`: candidates for one range; every one is dialed up front.
    ///
    /// Output:
    /// - The first successful reply, or `KvError::Send` once every replica
    ///   failed. It is retryable when at least one failure was.
    async fn send(
        &self,
        opts: SendOptions,
        replicas: ReplicaSlice,
        ba: BatchRequest,
    ) -> Result<BatchResponse, KvError> {
        if replicas.is_empty() {
            return Err(KvError::Send {
                message: format!(
                    "insufficient replicas ({}) to satisfy send request of 1",
                    replicas.len()
                ),
                retryable: false,
            });
        }

        let mut targets = Vec::with_capacity(replicas.len());
        for info in replicas.into_vec() {
            let conn = self.rpc.transport().dial(info.address()).map_err(|err| {
                KvError::rpc(format!("failed to dial {}: {err:#}", info.address()))
            })?;
            targets.push(Target { info, conn });
        }
        if opts.ordering == OrderingPolicy::Random {
            order_random(&mut targets);
        }

        let total = targets.len();
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(total);
        let mut pending = targets.into_iter();
        if let Some(first) = pending.next() {
            self.dispatch(first, &ba, opts.timeout, &done_tx);
        }

        let timer = tokio::time::sleep(opts.send_next_timeout);
        tokio::pin!(timer);
        let mut timer_armed = pending.len() > 0;
        let mut errors = 0usize;
        let mut retryable_errors = 0usize;

        loop {
            tokio::select! {
                _ = &mut timer, if timer_armed => {
                    self.stats.record_send_next_timeout();
                    match pending.next() {
                        Some(next) => {
                            tracing::trace!(
                                replica = %next.info.replica,
                                "timeout, trying next peer"
                            );
                            self.dispatch(next, &ba, opts.timeout, &done_tx);
                            timer.as_mut().reset(Instant::now() + opts.send_next_timeout);
                        }
                        None => timer_armed = false,
                    }
                }
                Some(result) = done_rx.recv() => {
                    let err = match result {
                        Ok(resp) => return Ok(resp),
                        Err(err) => err,
                    };
                    errors += 1;
                    if is_retryable(&err) {
                        retryable_errors += 1;
                    }
                    self.stats.record_replica_error();
                    tracing::debug!(errors, total, error = %format!("{err:#}"), "replica rpc failed");

                    let remaining = total - errors;
                    if remaining < 1 {
                        return Err(KvError::Send {
                            message: format!(
                                "too many errors encountered ({errors} of {total} total): {err:#}"
                            ),
                            retryable: remaining + retryable_errors >= 1,
                        });
                    }
                    if let Some(next) = pending.next() {
                        self.dispatch(next, &ba, opts.timeout, &done_tx);
                        timer.as_mut().reset(Instant::now() + opts.send_next_timeout);
                        timer_armed = pending.len() > 0;
                    }
                }
                else => {
                    return Err(KvError::Internal(
                        "replica completion channel closed".to_string(),
                    ));
                }
            }
        }
    }
}

/// Shuffle `targets`, keeping those with a ready connection in front.
fn order_random(targets: &mut Vec<Target>) {
    let mut rng = rand::thread_rng();
    let (mut ready, mut rest): (Vec<_>, Vec<_>) = targets
        .drain(..)
        .partition(|t| t.conn.state() == ConnectionState::Ready);
    ready.shuffle(&mut rng);
    rest.shuffle(&mut rng);
    ready.append(&mut rest);
    *targets = ready;
}

/// Bound `fut` by `timeout`; a zero timeout waits indefinitely.
async fn with_timeout<F>(timeout: Duration, addr: &str, fut: F) -> Completion
where
    F: Future<Output = Completion>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(KvError::rpc(format!("rpc to {addr} timed out after {timeout:?}")).into()),
    }
}

async fn call(conn: Arc<dyn Connection>, addr: &str, ba: BatchRequest) -> Completion {
    wait_ready(conn.as_ref(), addr).await?;
    conn.batch(ba).await
}

/// Wait for `conn` to become ready. A closed connection or a failed wait is
/// a retryable RPC error.
async fn wait_ready(conn: &dyn Connection, addr: &str) -> Result<(), KvError> {
    let mut state = conn.state();
    loop {
        match state {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Shutdown => {
                return Err(KvError::rpc(format!(
                    "rpc to {addr} failed as client connection was closed"
                )));
            }
            _ => {
                state = conn
                    .wait_for_state_change(state)
                    .await
                    .map_err(|err| KvError::rpc(format!("rpc to {addr} failed: {err:#}")))?;
            }
        }
    }
}

/// Disconnects and errors the replica reports as retryable.
fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(kv) = cause.downcast_ref::<KvError>() {
            return kv.is_retryable();
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            );
        }
        false
    })
}
