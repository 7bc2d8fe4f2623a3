use std::time::Duration;

use raftkv_store::StoreConfig;

#[derive(Clone, Debug)]
pub struct KvConfig {
    pub raft_config: openraft::Config,
    pub store_config: StoreConfig,

    /// How long a write may take to be committed and applied before the
    /// caller gets [`KvError::Timeout`](crate::KvError::Timeout). The write
    /// itself is not cancelled and may still be applied later.
    pub apply_timeout: Duration,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            raft_config: openraft::Config::default(),
            store_config: StoreConfig::default(),
            apply_timeout: Duration::from_secs(10),
        }
    }
}

impl KvConfig {
    pub fn testing(heartbeat: u64) -> Self {
        let mut config = Self::default();
        config.raft_config.heartbeat_interval = heartbeat;
        config.raft_config.election_timeout_min = heartbeat * 3;
        config.raft_config.election_timeout_max = heartbeat * 6;
        config.apply_timeout = Duration::from_millis(heartbeat * 40);
        config
    }
}
