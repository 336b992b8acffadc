//! Distributed sender configuration and its CLI/env surface.

use std::time::Duration;

use anyhow::ensure;
use clap::Args;
use holo_batch::NodeDescriptor;

use crate::retry::RetryOptions;

/// Default capacity of the range descriptor cache.
pub const DEFAULT_RANGE_DESCRIPTOR_CACHE_SIZE: usize = 1 << 20;
/// Default capacity of the leader cache.
pub const DEFAULT_LEADER_CACHE_SIZE: usize = 1 << 16;
/// Default number of descriptors fetched per range lookup.
pub const DEFAULT_RANGE_LOOKUP_MAX_RANGES: usize = 8;
/// Default delay before the next replica is tried while one is pending.
pub const DEFAULT_SEND_NEXT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on a single replica RPC.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
/// Default chance of considering intents on the lookup after a range
/// key mismatch.
pub const DEFAULT_INTENT_LOOKUP_PROBABILITY: f64 = 0.5;

/// Configuration for the distributed sender.
///
/// Inputs:
/// - Operator-provided cache sizes, timeouts and retry policy.
///
/// Output:
/// - Immutable config snapshot read by `DistSender` and the replica sender.
#[derive(Clone, Debug)]
pub struct DistSenderConfig {
    /// Maximum number of cached range descriptors.
    pub range_descriptor_cache_size: usize,
    /// Descriptors requested per range lookup (the target plus prefetched
    /// neighbours).
    pub range_lookup_max_ranges: usize,
    /// Maximum number of cached leaders.
    pub leader_cache_size: usize,
    /// Try the next replica when the pending one has not answered after this
    /// long. The pending RPC keeps running.
    pub send_next_timeout: Duration,
    /// Per-replica RPC timeout. `Duration::ZERO` disables it.
    pub rpc_timeout: Duration,
    /// Backoff policy of the per-range retry loop.
    pub retry: RetryOptions,
    /// Chance of considering intents on the lookup that follows a range key
    /// mismatch or a missing range.
    pub intent_lookup_probability: f64,
    /// Serve replicas on the local node through the registered local server
    /// instead of the transport.
    pub enable_local_calls: bool,
    /// Preset descriptor of the local node. When unset it is loaded lazily
    /// from gossip.
    pub node_descriptor: Option<NodeDescriptor>,
}

impl Default for DistSenderConfig {
    fn default() -> Self {
        Self {
            range_descriptor_cache_size: DEFAULT_RANGE_DESCRIPTOR_CACHE_SIZE,
            range_lookup_max_ranges: DEFAULT_RANGE_LOOKUP_MAX_RANGES,
            leader_cache_size: DEFAULT_LEADER_CACHE_SIZE,
            send_next_timeout: DEFAULT_SEND_NEXT_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            retry: RetryOptions::default(),
            intent_lookup_probability: DEFAULT_INTENT_LOOKUP_PROBABILITY,
            enable_local_calls: true,
            node_descriptor: None,
        }
    }
}

/// CLI options for the distributed sender.
#[derive(Args, Clone, Debug)]
pub struct DistSenderArgs {
    /// Range descriptor cache capacity.
    #[arg(
        long,
        env = "HOLO_DIST_RANGE_CACHE_SIZE",
        default_value_t = DEFAULT_RANGE_DESCRIPTOR_CACHE_SIZE
    )]
    pub range_cache_size: usize,

    /// Leader cache capacity.
    #[arg(long, env = "HOLO_DIST_LEADER_CACHE_SIZE", default_value_t = DEFAULT_LEADER_CACHE_SIZE)]
    pub leader_cache_size: usize,

    /// Descriptors fetched per range lookup (target plus prefetched neighbours).
    #[arg(
        long,
        env = "HOLO_DIST_RANGE_LOOKUP_MAX_RANGES",
        default_value_t = DEFAULT_RANGE_LOOKUP_MAX_RANGES
    )]
    pub range_lookup_max_ranges: usize,

    /// Delay before trying the next replica while one is pending (ms).
    #[arg(long, env = "HOLO_DIST_SEND_NEXT_TIMEOUT_MS", default_value_t = 10_000)]
    pub send_next_timeout_ms: u64,

    /// Per-replica RPC timeout (ms). Use `0` to disable.
    #[arg(long, env = "HOLO_DIST_RPC_TIMEOUT_MS", default_value_t = 10_000)]
    pub rpc_timeout_ms: u64,

    /// Initial retry backoff (ms).
    #[arg(long, env = "HOLO_DIST_RETRY_INITIAL_BACKOFF_MS", default_value_t = 250)]
    pub retry_initial_backoff_ms: u64,

    /// Maximum retry backoff (ms).
    #[arg(long, env = "HOLO_DIST_RETRY_MAX_BACKOFF_MS", default_value_t = 30_000)]
    pub retry_max_backoff_ms: u64,

    /// Backoff growth per attempt.
    #[arg(long, env = "HOLO_DIST_RETRY_MULTIPLIER", default_value_t = 2.0)]
    pub retry_multiplier: f64,

    /// Maximum retries per range. Use `0` for unlimited.
    #[arg(long, env = "HOLO_DIST_RETRY_MAX_RETRIES", default_value_t = 0)]
    pub retry_max_retries: usize,

    /// Chance of considering intents on the lookup after a range key mismatch.
    #[arg(
        long,
        env = "HOLO_DIST_INTENT_LOOKUP_PROBABILITY",
        default_value_t = DEFAULT_INTENT_LOOKUP_PROBABILITY
    )]
    pub intent_lookup_probability: f64,

    /// Always go through the transport, even for replicas on this node.
    #[arg(long, env = "HOLO_DIST_DISABLE_LOCAL_CALLS")]
    pub disable_local_calls: bool,
}

impl DistSenderArgs {
    pub fn into_config(self) -> anyhow::Result<DistSenderConfig> {
        ensure!(
            self.range_lookup_max_ranges > 0,
            "range lookup max ranges must be at least 1"
        );
        ensure!(
            self.retry_multiplier >= 1.0,
            "retry multiplier must be >= 1.0 (got {})",
            self.retry_multiplier
        );
        ensure!(
            self.retry_initial_backoff_ms <= self.retry_max_backoff_ms,
            "initial retry backoff {}ms exceeds max backoff {}ms",
            self.retry_initial_backoff_ms,
            self.retry_max_backoff_ms
        );
        ensure!(
            (0.0..=1.0).contains(&self.intent_lookup_probability),
            "intent lookup probability must be within [0, 1] (got {})",
            self.intent_lookup_probability
        );

        Ok(DistSenderConfig {
            range_descriptor_cache_size: self.range_cache_size,
            range_lookup_max_ranges: self.range_lookup_max_ranges,
            leader_cache_size: self.leader_cache_size,
            send_next_timeout: Duration::from_millis(self.send_next_timeout_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            retry: RetryOptions {
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
                multiplier: self.retry_multiplier,
                max_retries: self.retry_max_retries,
                ..RetryOptions::default()
            },
            intent_lookup_probability: self.intent_lookup_probability,
            enable_local_calls: !self.disable_local_calls,
            node_descriptor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        dist: DistSenderArgs,
    }

    #[test]
    fn defaults_match_config_defaults() {
        let cli = TestCli::try_parse_from(["test"]).expect("parse");
        let cfg = cli.dist.into_config().expect("valid");
        let defaults = DistSenderConfig::default();
        assert_eq!(cfg.range_descriptor_cache_size, defaults.range_descriptor_cache_size);
        assert_eq!(cfg.leader_cache_size, defaults.leader_cache_size);
        assert_eq!(cfg.range_lookup_max_ranges, defaults.range_lookup_max_ranges);
        assert_eq!(cfg.send_next_timeout, defaults.send_next_timeout);
        assert_eq!(cfg.rpc_timeout, defaults.rpc_timeout);
        assert_eq!(cfg.retry.initial_backoff, defaults.retry.initial_backoff);
        assert_eq!(cfg.retry.max_backoff, defaults.retry.max_backoff);
        assert!(cfg.enable_local_calls);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = TestCli::try_parse_from([
            "test",
            "--send-next-timeout-ms",
            "50",
            "--rpc-timeout-ms",
            "0",
            "--retry-max-retries",
            "4",
            "--disable-local-calls",
        ])
        .expect("parse");
        let cfg = cli.dist.into_config().expect("valid");
        assert_eq!(cfg.send_next_timeout, Duration::from_millis(50));
        assert_eq!(cfg.rpc_timeout, Duration::ZERO);
        assert_eq!(cfg.retry.max_retries, 4);
        assert!(!cfg.enable_local_calls);
    }

    #[test]
    fn rejects_invalid_values() {
        let cli = TestCli::try_parse_from(["test", "--intent-lookup-probability", "1.5"])
            .expect("parse");
        assert!(cli.dist.into_config().is_err());

        let cli = TestCli::try_parse_from([
            "test",
            "--retry-initial-backoff-ms",
            "5000",
            "--retry-max-backoff-ms",
            "10",
        ])
        .expect("parse");
        let err = cli.dist.into_config().expect_err("must fail");
        assert!(err.to_string().contains("exceeds max backoff"));
    }
}
