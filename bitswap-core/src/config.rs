use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the Decision loop, Session, and PeerManager. Loaded
/// through `bitswap_util::make_config` (defaults → config file → env),
/// mirroring how the rest of the workspace layers configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Upgrade a `Have` response to a full block send when the block is
    /// at most this many bytes.
    pub max_block_size_have_to_block: usize,
    /// How long the Decision loop waits for a task on an otherwise idle
    /// peer before giving up on this iteration.
    pub task_wait_timeout: Duration,
    /// Sleep between Decision iterations that find no eligible peer.
    pub decision_sleep_timeout: Duration,
    /// Session eviction threshold; reserved, not enforced in-flight.
    pub min_score: i64,
    /// A peer idle for longer than this is disconnected by the liveness
    /// sweep.
    pub max_no_active_time: Duration,
    /// Period of the PeerManager's liveness sweep.
    pub check_no_active_ping_period: Duration,
    /// Per-peer dial timeout.
    pub connect_timeout: Duration,
    /// How long a Session waits per step before retrying discovery or
    /// reissuing a want.
    pub peer_act_timeout: Duration,
    /// Ban duration applied to a peer after a failed dial or timeout.
    pub ban_peer_timeout: Duration,
    /// Overall timeout for `Bitswap::get`.
    pub get_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_block_size_have_to_block: 1024,
            task_wait_timeout: Duration::from_millis(500),
            decision_sleep_timeout: Duration::from_millis(100),
            min_score: -100,
            max_no_active_time: Duration::from_secs(3600),
            check_no_active_ping_period: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(7),
            peer_act_timeout: Duration::from_secs(5),
            ban_peer_timeout: Duration::from_secs(10),
            get_timeout: Duration::from_secs(60),
        }
    }
}
