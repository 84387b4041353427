//! feedd - RLN feed membership tracking and event sync daemon
//!
//! This daemon provides:
//! - Per-topic member tracking with epoch renewals and purges
//! - Verified, idempotent event storage keyed by payload hash
//! - Nullifier-based rate limiting with slashing evidence
//! - Live forwarding and paged backfill between peers
//! - Optional sealed topics

pub mod config;
pub mod feed;
pub mod membership;
pub mod server;
pub mod storage;
pub mod sync;
pub mod timeline;

pub use config::{Config, NodeState};
pub use feed::{TopicFeed, TopicKeys};
pub use membership::{MemberTracker, MembershipStats};
pub use server::{Server, ServerError, ServerStats};
pub use storage::{InsertOutcome, Storage, StorageError};
pub use sync::{Outcome, Session, SyncConfig, SyncError, SyncProtocol, SyncStats};
pub use timeline::Timeline;
