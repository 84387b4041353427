//! Configuration for feedd

use crate::feed::TopicKeys;
use crate::sync::SyncConfig;
use clap::Parser;
use rln_feed_core::epoch::{
    DEFAULT_CLOCK_SKEW_SECS, DEFAULT_EVENT_EPOCH_SECS, DEFAULT_MEMBERSHIP_EPOCH_SECS,
    RENEWAL_GRACE_SECS,
};
use rln_feed_core::{Bytes32, GroupContext, IdentitySecret, ProtocolParams};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// feedd - anonymous rate-limited topic feeds
#[derive(Parser, Debug, Clone)]
#[command(name = "feedd")]
#[command(about = "RLN feed membership tracking and event sync daemon")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9200")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/feedd")]
    pub data_dir: PathBuf,

    /// Topics to follow (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "general")]
    pub topics: Vec<String>,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Membership group root (64 hex chars)
    #[arg(long, env = "FEED_GROUP_ROOT")]
    pub group_root: String,

    /// Identity secret (64 hex chars); generated and persisted when absent
    #[arg(long, env = "FEED_IDENTITY_SECRET", hide_env_values = true)]
    pub identity_secret: Option<String>,

    /// Pseudonym put in published headers
    #[arg(long, default_value = "anon")]
    pub claimed_sender: String,

    /// Sealed topics as topic=secret (comma-separated)
    #[arg(long, env = "FEED_TOPIC_KEYS", value_delimiter = ',', hide_env_values = true)]
    pub topic_keys: Vec<String>,

    /// Membership epoch length in seconds
    #[arg(long, default_value_t = DEFAULT_MEMBERSHIP_EPOCH_SECS)]
    pub membership_epoch_secs: u64,

    /// Event (rate-limit) epoch length in seconds
    #[arg(long, default_value_t = DEFAULT_EVENT_EPOCH_SECS)]
    pub event_epoch_secs: u64,

    /// Accepted clock skew in seconds
    #[arg(long, default_value_t = DEFAULT_CLOCK_SKEW_SECS)]
    pub clock_skew_secs: u64,

    /// Concurrent proof verifications
    #[arg(long, default_value = "4")]
    pub verify_workers: usize,

    /// Maximum events per backfill batch
    #[arg(long, default_value = "256")]
    pub backfill_batch: u32,

    /// Membership maintenance interval in seconds
    #[arg(long, default_value = "30")]
    pub tick_interval_secs: u64,

    /// Dial and hello timeout in seconds
    #[arg(long, default_value = "10")]
    pub handshake_timeout_secs: u64,

    /// Publish each stdin line to this topic
    #[arg(long)]
    pub publish: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

fn parse_key(name: &str, value: &str) -> anyhow::Result<Bytes32> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| anyhow::anyhow!("{name} is not valid hex: {e}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("{name} must be 32 bytes, got {}", b.len()))
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.topics.is_empty() || self.topics.iter().any(|t| t.trim().is_empty()) {
            anyhow::bail!("At least one non-empty topic is required");
        }
        self.group()?;
        self.identity()?;
        if self.membership_epoch_secs == 0 || self.event_epoch_secs == 0 {
            anyhow::bail!("Epoch lengths must be positive");
        }
        if self.membership_epoch_secs <= 2 * RENEWAL_GRACE_SECS {
            anyhow::bail!(
                "Membership epoch must be longer than the {}s purge delay",
                2 * RENEWAL_GRACE_SECS
            );
        }
        if self.clock_skew_secs >= self.membership_epoch_secs {
            anyhow::bail!("Clock skew must be shorter than a membership epoch");
        }
        if self.verify_workers == 0 || self.backfill_batch == 0 || self.tick_interval_secs == 0 {
            anyhow::bail!("Workers, batch size and tick interval must be positive");
        }
        self.topic_keys()?;
        for entry in &self.topic_keys {
            if let Some((topic, _)) = entry.split_once('=') {
                if !self.topics.iter().any(|t| t == topic) {
                    anyhow::bail!("Topic key given for unfollowed topic {topic:?}");
                }
            }
        }
        if let Some(topic) = &self.publish {
            if !self.topics.contains(topic) {
                anyhow::bail!("Publish topic {topic:?} is not followed");
            }
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Log format must be json or pretty");
        }
        Ok(())
    }

    /// Timing parameters
    pub fn params(&self) -> ProtocolParams {
        ProtocolParams {
            membership_epoch_secs: self.membership_epoch_secs,
            event_epoch_secs: self.event_epoch_secs,
            clock_skew_secs: self.clock_skew_secs,
            renewal_grace_secs: RENEWAL_GRACE_SECS,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            params: self.params(),
            verify_workers: self.verify_workers,
            backfill_batch: self.backfill_batch,
        }
    }

    /// Membership group from the configured root
    pub fn group(&self) -> anyhow::Result<GroupContext> {
        Ok(GroupContext {
            root: parse_key("group root", &self.group_root)?,
        })
    }

    /// Identity secret given on the command line, if any
    pub fn identity(&self) -> anyhow::Result<Option<IdentitySecret>> {
        self.identity_secret
            .as_deref()
            .map(|s| parse_key("identity secret", s).map(IdentitySecret))
            .transpose()
    }

    pub fn topic_keys(&self) -> anyhow::Result<TopicKeys> {
        TopicKeys::from_entries(self.topic_keys.iter().map(String::as_str))
    }
}

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Our transport keypair seed (deterministic recovery)
    pub keypair_seed: [u8; 32],
    /// Member identity used for proving
    pub identity_secret: [u8; 32],
}
