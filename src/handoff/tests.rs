//! Tests for the handoff store.

use std::net::{IpAddr, Ipv4Addr};

use super::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct StoreFixture {
    _tmp: TempDir,
    store: HandoffStore,
}

#[fixture]
fn store_fixture() -> StoreFixture {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("state").join("handoff.toml"))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    StoreFixture {
        _tmp: tmp,
        store: HandoffStore::new(path),
    }
}

#[fixture]
fn record() -> HandoffRecord {
    HandoffRecord {
        volume_id: String::from("vol-1"),
        instance: InstanceHandle {
            id: String::from("srv-1"),
            zone: String::from("fr-par-1"),
        },
        networking: InstanceNetworking {
            public_ip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)),
            ssh_port: 22,
        },
        device: String::from("/dev/sdb"),
        mount_path: String::from("/data"),
        instance_created: true,
        key_file: Some(String::from("~/.ssh/id_ed25519")),
        source_snapshot: None,
    }
}

#[rstest]
fn write_then_load_preserves_record(store_fixture: StoreFixture, record: HandoffRecord) {
    let StoreFixture { store, .. } = store_fixture;
    store
        .write(&record)
        .unwrap_or_else(|err| panic!("write: {err}"));

    let loaded = store.load().unwrap_or_else(|err| panic!("load: {err}"));
    assert_eq!(loaded, record);
}

#[rstest]
fn second_write_is_refused(store_fixture: StoreFixture, record: HandoffRecord) {
    let StoreFixture { store, .. } = store_fixture;
    store
        .write(&record)
        .unwrap_or_else(|err| panic!("write: {err}"));

    let err = store.write(&record).expect_err("overwrite should fail");
    assert!(matches!(err, HandoffError::AlreadyExists { .. }));
}

#[rstest]
fn replace_overwrites_in_place(store_fixture: StoreFixture, record: HandoffRecord) {
    let StoreFixture { store, .. } = store_fixture;
    store
        .write(&record)
        .unwrap_or_else(|err| panic!("write: {err}"));
    let updated = HandoffRecord {
        instance_created: false,
        ..record
    };

    store
        .replace(&updated)
        .unwrap_or_else(|err| panic!("replace: {err}"));

    let loaded = store.load().unwrap_or_else(|err| panic!("load: {err}"));
    assert_eq!(loaded, updated);
    let parent = store
        .path()
        .parent()
        .unwrap_or_else(|| panic!("fixture path has a parent"));
    let leftovers: Vec<String> = std::fs::read_dir(parent)
        .unwrap_or_else(|err| panic!("list: {err}"))
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec![String::from("handoff.toml")]);
}

#[rstest]
fn replace_requires_an_existing_file(store_fixture: StoreFixture, record: HandoffRecord) {
    let err = store_fixture
        .store
        .replace(&record)
        .expect_err("nothing to replace");
    assert!(matches!(err, HandoffError::Missing { .. }));
}

#[rstest]
fn load_without_file_points_at_setup(store_fixture: StoreFixture) {
    let err = store_fixture.store.load().expect_err("missing file");
    assert!(matches!(err, HandoffError::Missing { .. }));
    assert!(err.to_string().contains("rebundle setup"));
}

#[rstest]
fn remove_is_idempotent(store_fixture: StoreFixture, record: HandoffRecord) {
    let StoreFixture { store, .. } = store_fixture;
    store
        .write(&record)
        .unwrap_or_else(|err| panic!("write: {err}"));
    store.remove().unwrap_or_else(|err| panic!("remove: {err}"));
    store
        .remove()
        .unwrap_or_else(|err| panic!("second remove: {err}"));
    assert!(!store.exists().unwrap_or_else(|err| panic!("exists: {err}")));
}

#[rstest]
fn missing_key_is_reported(store_fixture: StoreFixture) {
    let StoreFixture { store, .. } = store_fixture;
    let parent = store
        .path()
        .parent()
        .unwrap_or_else(|| panic!("fixture path has a parent"));
    std::fs::create_dir_all(parent).unwrap_or_else(|err| panic!("mkdir: {err}"));
    std::fs::write(store.path(), "volume = \"vol-1\"\n")
        .unwrap_or_else(|err| panic!("seed: {err}"));

    let err = store.load().expect_err("incomplete file");
    assert!(
        matches!(err, HandoffError::MissingKey { key, .. } if key == PUBLIC_ADDRESS_KEY),
        "unexpected error: {err}"
    );
}

#[rstest]
fn invalid_port_is_reported(store_fixture: StoreFixture, record: HandoffRecord) {
    let StoreFixture { store, .. } = store_fixture;
    let mut table = to_table(&record);
    table.insert(
        String::from(SSH_PORT_KEY),
        toml::Value::String(String::from("ssh")),
    );
    let parent = store
        .path()
        .parent()
        .unwrap_or_else(|| panic!("fixture path has a parent"));
    std::fs::create_dir_all(parent).unwrap_or_else(|err| panic!("mkdir: {err}"));
    let rendered =
        toml::to_string_pretty(&table).unwrap_or_else(|err| panic!("render: {err}"));
    std::fs::write(store.path(), rendered).unwrap_or_else(|err| panic!("seed: {err}"));

    let err = store.load().expect_err("bad port");
    assert!(matches!(err, HandoffError::InvalidValue { key, .. } if key == SSH_PORT_KEY));
}
