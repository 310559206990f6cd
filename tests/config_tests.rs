// Configuration loading tests
// TOML parsing, defaults, and the startup checks that must halt the sidecar

use std::fs;
use stealth_sidecar::{config, DefenseError};
use tempfile::TempDir;

const FULL: &str = r#"
[clock]
genesis_unix = 1606824023
seconds_per_slot = 12
slots_per_epoch = 32

[juggler]
extra_subnets = 10
validator_indices = [3, 17]

[relay]
rate_limit_per_epoch = 50
group_key = "0101010101010101010101010101010101010101010101010101010101010101"

[[relay.friends]]
peer_id = "12D3KooWfriendA"
address = "/ip4/10.0.0.2/udp/9000/quic-v1"
public_key = "aa"

[[relay.friends]]
peer_id = "12D3KooWfriendB"
address = "/ip4/10.0.0.3/udp/9000/quic-v1"
public_key = "bb"

[[relay.friends]]
peer_id = "12D3KooWfriendC"
address = "/ip4/10.0.0.4/udp/9000/quic-v1"
public_key = "cc"

[attack]
simultaneity_tolerance_ms = 25
confidence_threshold = 0.9

[metrics]
bind = "127.0.0.1:9911"
"#;

#[tokio::test]
async fn test_load_from_disk() {
    println!("🧪 Testing config load from a file...");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("config.toml");
    fs::write(&path, FULL).unwrap();

    let cfg = config::load(&path).expect("config should load");
    assert_eq!(cfg.juggler.extra_subnets, 10);
    assert_eq!(cfg.relay.friends.len(), 3);
    assert_eq!(cfg.relay.friends[1].peer_id, "12D3KooWfriendB");
    assert_eq!(cfg.relay.group_key_bytes().unwrap(), Some([1u8; 32]));
    assert_eq!(cfg.attack.simultaneity_tolerance_ms, 25);
    assert_eq!(cfg.metrics.bind, "127.0.0.1:9911");
    assert_eq!(cfg.net.fork_digest, "6a95a1a9", "Unset sections fall back to defaults");
    assert_eq!(cfg.juggler.call_timeout_ms, 5_000);
    assert_eq!(cfg.backbone_set().unwrap().ids(), vec![6, 7, 34, 35]);
    println!("✅ Loaded {} friends", cfg.relay.friends.len());
}

#[tokio::test]
async fn test_shipped_config_and_empty_file_are_valid() {
    println!("🧪 Testing the shipped config.toml and an empty file...");

    let shipped = config::load_from_str(include_str!("../config.toml")).expect("shipped config is valid");
    assert_eq!(shipped.juggler.extra_subnets, 8);
    assert!(shipped.relay.friends.is_empty(), "Empty roster is a valid configuration");

    let empty = config::load_from_str("").expect("every section has defaults");
    assert_eq!(empty.clock.slots_per_epoch, 32);
}

#[tokio::test]
async fn test_missing_file_and_bad_toml() {
    let dir = TempDir::new().unwrap();
    let err = config::load(dir.path().join("nope.toml")).unwrap_err();
    assert!(err.to_string().contains("couldn’t read config file"));

    assert!(config::load_from_str("[juggler\nextra_subnets = 3").is_err());
}

#[tokio::test]
async fn test_validation_rejects_fatal_settings() {
    println!("🧪 Testing startup validation...");

    let cases = [
        ("[clock]\nseconds_per_slot = 0", "zero slot duration"),
        ("[clock]\nslots_per_epoch = 0", "zero slots per epoch"),
        ("[juggler]\nextra_subnets = 0", "no extra subnets"),
        ("[juggler]\nextra_subnets = 62", "backbone + k covers all 64"),
        ("[juggler]\nbackbone_subnets_per_validator = 0", "empty backbone formula"),
        ("[juggler]\nvalidator_indices = []", "no local validators"),
        ("[attack]\nconfidence_threshold = 1.5", "threshold above 1"),
        ("[attack]\nconfidence_threshold = -0.1", "threshold below 0"),
        ("[attack]\nconfidence_threshold = nan", "non-finite threshold"),
        ("[relay]\ngroup_key = \"abcd\"", "short group key"),
        ("[relay]\nidentity_secret = \"zz\"", "non-hex identity"),
        (
            "[[relay.friends]]\npeer_id = \"a\"\naddress = \"/ip4/10.0.0.2/udp/9000/quic-v1\"\npublic_key = \"aa\"",
            "friends without a group key",
        ),
        (
            "[relay]\ngroup_key = \"0101010101010101010101010101010101010101010101010101010101010101\"\n\n[[relay.friends]]\npeer_id = \"a\"\naddress = \"/ip4/10.0.0.2/udp/9000/quic-v1\"\npublic_key = \"zz\"",
            "non-hex friend public key",
        ),
    ];
    for (toml_text, why) in cases {
        let err = config::load_from_str(toml_text).expect_err(why);
        let defense = err.downcast_ref::<DefenseError>();
        assert!(
            matches!(defense, Some(DefenseError::Configuration(_))),
            "{} should be a configuration error, got {}",
            why,
            err
        );
    }

    assert!(config::load_from_str("[juggler]\nextra_subnets = 61").is_ok(), "2 backbone + 61 extra = 63 is allowed");
    assert_eq!(
        config::load_from_str("").unwrap().relay.group_key_bytes().unwrap(),
        None,
        "No silent fallback key for an unconfigured mesh"
    );
}
