use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: u64,
    /// Advertised address, directly usable as a dispatch target by clients.
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub id: u64,
    pub start_with_leader: bool,
    pub addr: String,
    pub metrics_addr: String,
    pub group: String,
    pub data_path: String,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Fence proposals with the term observed at receipt time. Disabling
    /// this reopens the ABA window on leadership changes.
    #[serde(default = "default_check_term")]
    pub check_term: bool,
    pub node_list: Vec<NodeConfig>,
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_check_term() -> bool {
    true
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            start_with_leader: false,
            addr: "0.0.0.0:4001".to_string(),
            metrics_addr: "0.0.0.0:4011".to_string(),
            group: "replica_0".to_string(),
            data_path: "./data".to_string(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            check_term: default_check_term(),
            node_list: Vec::new(),
        }
    }

    /// Loads the runtime config into the process-wide instance. A missing
    /// file keeps the defaults; a malformed file is fatal at startup.
    pub fn from_toml(path: &str) -> anyhow::Result<()> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("runtime config file {} not readable ({}), using defaults", path, e);
                return Ok(());
            }
        };
        let config: RuntimeConfig = toml::from_str(&contents)?;
        *instance().lock().unwrap() = config;
        Ok(())
    }

    /// Advertised address of a peer by node id.
    pub fn peer_addr(&self, id: u64) -> Option<String> {
        self.node_list
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            id = 2
            start_with_leader = true
            addr = "0.0.0.0:4002"
            metrics_addr = "0.0.0.0:4012"
            group = "replica_0"
            data_path = "./data/node2"

            [[node_list]]
            id = 1
            addr = "http://127.0.0.1:4001"

            [[node_list]]
            id = 2
            addr = "http://127.0.0.1:4002"
        "#;
        let config: RuntimeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.id, 2);
        assert!(config.start_with_leader);
        assert_eq!(config.snapshot_interval_secs, 60);
        assert!(config.check_term);
        assert_eq!(
            config.peer_addr(1),
            Some("http://127.0.0.1:4001".to_string())
        );
        assert_eq!(config.peer_addr(9), None);
    }
}
