use docmesh_sync::settings::{MemorySettingsSource, ReplicatorSettings, SettingsSource};
use docmesh_sync::tweaks::passphrase_hash;
use docmesh_sync::{SyncError, TweakValues};
use std::io::Write;

fn settings(passphrase: &str) -> ReplicatorSettings {
    ReplicatorSettings {
        room: "notes".into(),
        passphrase: passphrase.into(),
        ..Default::default()
    }
}

// ── Settings ────────────────────────────────────────────────────

#[test]
fn missing_fields_take_defaults() {
    let parsed = ReplicatorSettings::from_json(r#"{"device_name": "laptop", "headless": true}"#)
        .unwrap();

    assert_eq!(parsed.device_name, "laptop");
    assert!(parsed.headless);
    assert_eq!(parsed.batch_size, 250);
    assert_eq!(parsed.queue_min_delay_ms, 2_000);
    assert_eq!(parsed.queue_max_delay_ms, 10_000);
}

#[test]
fn malformed_settings_are_a_config_error() {
    let err = ReplicatorSettings::from_json("{ not json").unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[test]
fn settings_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let original = ReplicatorSettings {
        device_name: "desk".into(),
        deny_list: "laptop".into(),
        ..Default::default()
    };
    file.write_all(original.to_json().unwrap().as_bytes()).unwrap();

    let loaded = ReplicatorSettings::load(file.path()).unwrap();
    assert_eq!(loaded, original);

    let missing = ReplicatorSettings::load(file.path().with_extension("absent"));
    assert!(matches!(missing, Err(SyncError::Config(_))));
}

#[test]
fn memory_source_saves() {
    let source = MemorySettingsSource::new(settings("a"));
    source.save(settings("b")).unwrap();
    assert_eq!(source.current().passphrase, "b");
}

// ── Tweak values ────────────────────────────────────────────────

#[test]
fn passphrase_is_never_sent_in_clear() {
    let values = TweakValues::for_window(&settings("correct horse"), 100);
    let json = serde_json::to_string(&values).unwrap();

    assert!(!json.contains("correct horse"));
    assert!(json.contains("passphraseHash"));
    assert!(json.contains("caseSensitivePaths"));
    assert_eq!(values.passphrase_hash.len(), 64);
}

#[test]
fn hash_depends_on_room_and_window() {
    let base = passphrase_hash("notes", "pw", 10);
    assert_eq!(base, passphrase_hash("notes", "pw", 10));
    assert_ne!(base, passphrase_hash("other", "pw", 10));
    assert_ne!(base, passphrase_hash("notes", "pw", 11));
}

#[test]
fn identical_settings_are_compatible() {
    let local = settings("pw");
    let remote = TweakValues::for_window(&local, 500);

    let comparison = TweakValues::compare_at(&local, &remote, 500);
    assert!(comparison.is_compatible());
    assert!(comparison.differences.is_empty());
}

#[test]
fn previous_window_still_matches() {
    let local = settings("pw");
    let remote = TweakValues::for_window(&local, 499);

    assert!(TweakValues::compare_at(&local, &remote, 500).is_compatible());

    let stale = TweakValues::for_window(&local, 498);
    assert!(!TweakValues::compare_at(&local, &stale, 500).is_compatible());
}

#[test]
fn peer_clock_an_hour_ahead_still_matches() {
    let local = settings("pw");
    let remote = TweakValues::for_window(&local, 501);

    assert!(TweakValues::compare_at(&local, &remote, 500).is_compatible());

    let far_ahead = TweakValues::for_window(&local, 502);
    assert!(!TweakValues::compare_at(&local, &far_ahead, 500).is_compatible());
}

#[test]
fn different_passphrase_is_incompatible() {
    let remote = TweakValues::for_window(&settings("other"), 500);
    let comparison = TweakValues::compare_at(&settings("pw"), &remote, 500);

    assert!(comparison.passphrase_mismatch);
    assert!(!comparison.is_compatible());
}

#[test]
fn other_differences_are_listed_but_compatible() {
    let local = settings("pw");
    let remote_settings = ReplicatorSettings {
        chunk_size: 200,
        case_sensitive_paths: true,
        ..local.clone()
    };
    let remote = TweakValues::for_window(&remote_settings, 500);

    let comparison = TweakValues::compare_at(&local, &remote, 500);
    assert!(comparison.is_compatible());
    assert_eq!(comparison.differences, vec!["chunkSize", "caseSensitivePaths"]);
}
