use std::time::Duration;

use sluice_core::config::{ConfigError, SluiceConfig};
use sluice_core::engine::{Channel, ProxyEngine};

use crate::*;

fn write(name: &str, text: &str) -> std::path::PathBuf {
    let path = temp_path(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, text).unwrap();
    path
}

/// A TOML file with two instances loads, resolves, and drives engines.
#[test]
fn test_toml_file_builds_engines() {
    let path = write(
        "sluice.toml",
        r#"
[runtime]
reaper_interval_secs = 2

[[proxy]]
name = "dns"
source = "127.0.0.1:5300"
destinations = "8.8.8.8:53, 1.1.1.1:53"
idle_timeout_secs = 30

[[proxy]]
source = "[::1]:9000"
destinations = ["[2001:db8::1]:9000", "[2001:db8::2]:9000"]
recv_batch = 16
obfuscation = { key = 171, size = 12 }
"#,
    );

    let config = SluiceConfig::load_from(&path).unwrap();
    assert_eq!(config.runtime.reaper_interval_secs, 2);
    let instances = config.resolve().unwrap();
    assert_eq!(instances.len(), 2);

    let dns = &instances[0];
    assert_eq!(dns.name, "dns");
    assert_eq!(dns.idle_timeout, Duration::from_secs(30));
    assert_eq!(dns.destinations, vec![addr("8.8.8.8:53"), addr("1.1.1.1:53")]);

    let tunnel = &instances[1];
    assert_eq!(tunnel.name, "[::1]:9000");
    assert_eq!(tunnel.recv_batch, 16);
    assert_eq!(tunnel.obfuscation.key, 171);
    assert_eq!(tunnel.obfuscation.size, 12);

    let mut engine = ProxyEngine::new(dns, 4).unwrap();
    let mut io = SimTransport::default();
    deliver(&mut engine, &mut io, Channel::Listener, addr("127.0.0.1:40000"), b"q", 0);
    deliver(&mut engine, &mut io, Channel::Listener, addr("127.0.0.1:40000"), b"q", 0);
    let dests: Vec<_> = flush(&mut engine).into_iter().map(|s| s.dest).collect();
    assert_eq!(dests, dns.destinations);

    let engine = ProxyEngine::new(tunnel, 4).unwrap();
    assert_eq!(engine.recv_batch(), 16);
    assert_eq!(engine.listen_addr(), addr("[::1]:9000"));
}

#[test]
fn test_json_file_is_accepted() {
    let doc = serde_json::json!({
        "runtime": { "stats_interval_secs": 0 },
        "proxy": [
            { "source": "127.0.0.1:1234", "destinations": "8.8.8.8:53", "debug": true }
        ]
    });
    let path = write("sluice.json", &serde_json::to_string_pretty(&doc).unwrap());

    let config = SluiceConfig::load_from(&path).unwrap();
    assert_eq!(config.runtime.stats_interval_secs, 0);
    let instances = config.resolve().unwrap();
    assert_eq!(instances.len(), 1);
    assert!(instances[0].debug);
    assert!(!instances[0].obfuscation.is_enabled());
}

/// First start: the default file is written and immediately usable.
#[test]
fn test_default_file_is_written_then_loaded() {
    let path = temp_path("fresh/config.toml");
    assert!(!path.exists());

    SluiceConfig::write_default_if_missing(&path).unwrap();
    assert!(path.exists());

    let instances = SluiceConfig::load_from(&path).unwrap().resolve().unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].source, addr("127.0.0.1:1234"));
    assert_eq!(instances[0].destinations, vec![addr("8.8.8.8:53")]);
}

/// A mistyped path on the command line is an error, never a fresh default
/// forwarder.
#[test]
fn test_explicit_missing_path_fails_without_writing() {
    let path = temp_path("etc/sluice-typo.toml");

    let err = SluiceConfig::locate(Some(path.clone())).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::ReadFailed(ref p, ref e) if *p == path && e.kind() == std::io::ErrorKind::NotFound
    ));
    assert!(err.to_string().contains("sluice-typo.toml"));
    assert!(!path.exists());
    assert!(!path.parent().unwrap().exists(), "no directories created");
}

#[test]
fn test_explicit_existing_path_is_loaded() {
    let path = write(
        "explicit.toml",
        "[[proxy]]\nsource = \"127.0.0.1:7100\"\ndestinations = \"10.0.0.1:7100\"\n",
    );
    let (used, config) = SluiceConfig::locate(Some(path.clone())).unwrap();
    assert_eq!(used, path);
    let instances = config.resolve().unwrap();
    assert_eq!(instances[0].source, addr("127.0.0.1:7100"));
}

#[test]
fn test_existing_file_is_not_overwritten() {
    let original = "[[proxy]]\nsource = \"127.0.0.1:7000\"\ndestinations = \"10.0.0.1:7000\"\n";
    let path = write("keep.toml", original);
    SluiceConfig::write_default_if_missing(&path).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
}

#[test]
fn test_broken_files_name_the_path() {
    let toml_path = write("broken.toml", "[[proxy]\nsource = ");
    let err = SluiceConfig::load_from(&toml_path).unwrap_err();
    assert!(matches!(err, ConfigError::ParseFailed(ref p, _) if *p == toml_path));
    assert!(err.to_string().contains("broken.toml"));

    let json_path = write("broken.json", "{ \"proxy\": [ ");
    let err = SluiceConfig::load_from(&json_path).unwrap_err();
    assert!(matches!(err, ConfigError::JsonFailed(ref p, _) if *p == json_path));
}

#[test]
fn test_unresolvable_destination_fails_before_start() {
    let path = write(
        "bad-dest.toml",
        "[[proxy]]\nsource = \"127.0.0.1:1234\"\ndestinations = \"8.8.8.8:53,8.8.4.4\"\n",
    );
    let err = SluiceConfig::load_from(&path).unwrap().resolve().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidEndpoint { ref value, .. } if value == "8.8.4.4"));
}

#[test]
fn test_env_overrides_runtime_settings() {
    let path = write("env.toml", "[runtime]\npool_block_size = 10\n");
    std::env::set_var("SLUICE_RUNTIME__POOL_BLOCK_SIZE", "64");
    let config = SluiceConfig::load_from(&path);
    std::env::remove_var("SLUICE_RUNTIME__POOL_BLOCK_SIZE");
    assert_eq!(config.unwrap().runtime.pool_block_size, 64);
}
