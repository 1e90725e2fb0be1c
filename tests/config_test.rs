//! Config loading and defaults integration tests

use std::path::PathBuf;
use std::time::Duration;

use ledger_node::config::Config;
use ledger_node::signing::generate_key;
use ledger_node::ConfigError;

fn public_key() -> String {
    hex::encode(generate_key().verifying_key().to_bytes())
}

fn peers_toml(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| {
            format!(
                "[[peers]]\nid = {}\naddress = \"127.0.0.1:{}\"\npublic_key = \"{}\"\n",
                id,
                2052 + id,
                public_key()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config = Config::parse("[node]\nid = 3\n").expect("valid config");

    assert_eq!(config.node.id, 3);
    assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/ledger-node"));
    assert!(!config.node.is_testnet);
    assert!(config.node.max_processors >= 32);
    assert_eq!(config.storage.ledger_file, "ledger.db");
    assert_eq!(config.network.listen_addr, "0.0.0.0:2052");
    assert!(!config.consensus.free_registrations);
    assert_eq!(config.total_nodes(), 1);
    config.validate().unwrap();
}

#[test]
fn test_config_with_all_fields() {
    let toml_str = format!(
        r#"
[node]
id = 0
data_dir = "/tmp/ledger-test"
is_testnet = true
max_processors = 16

[consensus]
total_nodes = 8
max_election_time_ms = 5000
vote_resend_interval_ms = 250
resync_time_ms = 2000
max_resync_attempts = 5
free_registrations = true

[storage]
ledger_file = "state.db"
max_retries = 7
retry_base_delay_ms = 10
pending_ttl_secs = 60

[network]
listen_addr = "127.0.0.1:3000"
retransmit_interval_ms = 100
max_retransmits = 4
max_datagram_size = 32000
inbound_queue = 64

{}
"#,
        peers_toml(&[1, 2, 3])
    );

    let config = Config::parse(&toml_str).expect("valid config");
    config.validate().unwrap();

    assert_eq!(config.ledger_path(), PathBuf::from("/tmp/ledger-test/state.db"));
    assert_eq!(config.peers.len(), 3);
    assert_eq!(config.peer_keys().unwrap().len(), 3);

    let settings = config.consensus_settings();
    assert_eq!(settings.quorum.total_nodes, 8);
    assert_eq!(
        (settings.quorum.positive, settings.quorum.negative, settings.quorum.resync_break),
        (5, 1, 2)
    );
    assert_eq!(settings.max_election_time, Duration::from_secs(5));
    assert_eq!(settings.max_resync_attempts, 5);
    assert!(settings.free_registrations);

    let options = config.ledger_options();
    assert_eq!(options.retry.max_attempts, 7);
    assert_eq!(options.pending_ttl, chrono::Duration::seconds(60));

    let transport = config.transport_settings();
    assert_eq!(transport.retransmit_interval, Duration::from_millis(100));
    assert_eq!(transport.max_retransmits, 4);
    assert_eq!(config.listen_addr().unwrap().port(), 3000);
}

#[test]
fn test_threshold_overrides_are_normalized() {
    let config = Config::parse("[node]\nid = 0\n[consensus]\ntotal_nodes = 5\npositive = 5\nnegative = 2\n").unwrap();
    let quorum = config.consensus_settings().quorum;
    assert!(quorum.positive + quorum.negative < 5);
    assert!(quorum.resync_break + quorum.positive < 5);
}

#[test]
fn test_duplicate_peer_rejected() {
    let toml_str = format!("[node]\nid = 0\n\n{}", peers_toml(&[1, 1]));
    let config = Config::parse(&toml_str).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_peer_with_own_id_rejected() {
    let toml_str = format!("[node]\nid = 2\n\n{}", peers_toml(&[2]));
    let config = Config::parse(&toml_str).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_bad_peer_key_rejected() {
    let toml_str = "[node]\nid = 0\n[[peers]]\nid = 1\naddress = \"127.0.0.1:2053\"\npublic_key = \"abcd\"\n";
    let config = Config::parse(toml_str).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::InvalidKey(_))));
}

#[test]
fn test_too_small_network_rejected() {
    let toml_str = format!("[node]\nid = 0\n[consensus]\ntotal_nodes = 2\n\n{}", peers_toml(&[1, 2]));
    let config = Config::parse(&toml_str).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.node.id, 1);
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("ledger-node.toml");
    std::fs::write(&path, "[node]\nid = 9\n[network]\nlisten_addr = \"127.0.0.1:0\"\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.node.id, 9);
    assert_eq!(config.listen_addr().unwrap().port(), 0);
}

#[test]
fn test_invalid_toml_returns_error() {
    let result = Config::parse("this is not valid { toml }}}");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}
