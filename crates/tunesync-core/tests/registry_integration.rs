//! Integration tests for the persisted device registry.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fs;

use tempfile::TempDir;
use tunesync_core::{AppConfig, DeviceProfile, DeviceRegistry, RegistryEvent, TransportConfig};

#[test]
fn test_registry_round_trip_through_disk() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("devices.json");

    let mut registry = DeviceRegistry::load(&path);
    registry
        .store_device(
            DeviceProfile::new("Walkman", "/media/walkman", TransportConfig::Filesystem),
            None,
        )
        .expect("store");
    registry
        .store_device(
            DeviceProfile::new("Phone", "/sdcard/Music", TransportConfig::adb(None)),
            None,
        )
        .expect("store");
    registry.select_device(0).expect("select");

    let reloaded = DeviceRegistry::load(&path);
    assert_eq!(reloaded.devices(), registry.devices());
    assert_eq!(reloaded.current_index(), Some(0));
    assert_eq!(
        reloaded.current_device().map(|d| d.name.as_str()),
        Some("Walkman")
    );
}

#[test]
fn test_truncated_registry_is_set_aside() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("devices.json");
    fs::write(&path, r#"{"devices":[{"name":"Walk"#).expect("write");

    let registry = DeviceRegistry::load(&path);

    assert!(registry.devices().is_empty());
    assert_eq!(registry.current_index(), None);
    assert!(!path.exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("devices.json.old")).expect("backup"),
        r#"{"devices":[{"name":"Walk"#
    );
}

#[cfg(unix)]
#[test]
fn test_registry_file_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("nested").join("devices.json");
    let mut registry = DeviceRegistry::load(&path);
    registry
        .store_device(
            DeviceProfile::new(
                "Player",
                "/music",
                TransportConfig::ftp("player.local", "music", "secret"),
            ),
            None,
        )
        .expect("store");

    let mode = fs::metadata(&path).expect("metadata").permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_events_follow_mutations() {
    let dir = TempDir::new().expect("temp dir");
    let mut registry = DeviceRegistry::load(dir.path().join("devices.json"));
    let events = registry.subscribe();

    registry
        .store_device(
            DeviceProfile::new("One", "/one", TransportConfig::Filesystem),
            None,
        )
        .expect("store");
    registry.delete_device(0).expect("delete");

    let received: Vec<RegistryEvent> = events.try_iter().collect();
    assert_eq!(
        received,
        vec![
            RegistryEvent::DeviceListChanged,
            RegistryEvent::CurrentDeviceChanged,
            RegistryEvent::CurrentDeviceChanged,
            RegistryEvent::DeviceListChanged,
        ]
    );
    assert_eq!(registry.current_index(), None);
}

#[test]
fn test_config_points_at_registry() {
    let dir = TempDir::new().expect("temp dir");
    let config_path = dir.path().join("config.json");
    let registry_path = dir.path().join("devices.json");
    let config = AppConfig {
        registry_path: Some(registry_path.clone()),
        ..AppConfig::default()
    };
    config.save_to(&config_path).expect("save config");

    let loaded = AppConfig::load_from(&config_path).expect("load config");
    let mut registry = DeviceRegistry::load(loaded.registry_file());
    registry
        .store_device(
            DeviceProfile::new("Player", "/music", TransportConfig::Filesystem),
            None,
        )
        .expect("store");

    assert!(registry_path.exists());
}
