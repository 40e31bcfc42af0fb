// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end pipeline tests: export a live store into an archive, then
//! restore it into a second store, with and without a version gap.

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use crowbar_backup::store::mem::MemStore;
use crowbar_backup::{
    archive, BackupStore, Config, Export, Restore, RestoreMode, RecordKind,
};
use crowbar_common::version::PlatformVersion;
use serde_json::json;
use slog::{o, Logger};

fn log() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn test_config(root: &Utf8Path) -> Config {
    Config {
        backup_dir: root.join("backups"),
        restore_root: root.join("restore"),
        system_root: root.join("system"),
        named_conf: root.join("system/etc/bind/named.conf"),
        ..Config::default()
    }
}

fn populated_store() -> MemStore {
    let store = MemStore::new();
    store.insert_record(
        RecordKind::Client,
        "admin-client",
        json!({"public_key": "-----BEGIN PUBLIC KEY-----"}),
    );
    store.insert_record(
        RecordKind::Node,
        "node1",
        json!({"fqdn": "node1.example.com", "run_list": ["role[dns-server]"]}),
    );
    store.insert_record(RecordKind::Role, "dns-server", json!({"run_list": []}));
    store.insert_bag_item(
        "crowbar",
        "dns-default",
        json!({"attributes": {"dns": {"domain": "example.com"}}}),
    );
    store
}

#[test]
fn export_restore_round_trip_without_version_gap() {
    let dir = Utf8TempDir::new().unwrap();
    let config = test_config(dir.path());
    let source = populated_store();
    let version = PlatformVersion::new(6, 0);

    let backups = BackupStore::new(&log(), config.clone());
    let export = Export::new(&log(), &source, &config, version);
    let backup = backups
        .create(&export, "roundtrip", Some("20230101-120000"))
        .unwrap();
    assert_eq!(backup.filename(), "roundtrip-20230101-120000.tar.gz");
    assert!(backup.size().unwrap() > 0);
    assert_eq!(backups.list().unwrap().len(), 1);

    let target = MemStore::new();
    let mut restore = Restore::prepare(
        &log(),
        &config,
        &target,
        backup.path(),
        RestoreMode::Complete,
    )
    .unwrap();
    restore.validate().unwrap();

    // Same version on both sides: no migration involved.
    assert!(!restore.needs_upgrade(version).unwrap());

    let summary = restore.restore().unwrap();
    restore.cleanup();
    assert!(summary.skipped.is_empty());

    // Records come back under the same names, with the type tag the export
    // added.
    for (kind, name) in [
        (RecordKind::Client, "admin-client"),
        (RecordKind::Node, "node1"),
        (RecordKind::Role, "dns-server"),
    ] {
        let restored = target.record(kind, name).unwrap();
        let mut expected = source.record(kind, name).unwrap();
        expected
            .as_object_mut()
            .unwrap()
            .insert("json_class".into(), json!(kind.type_tag()));
        assert_eq!(restored, expected, "{kind} {name}");
    }
}

#[test]
fn restore_with_version_gap_migrates_before_loading() {
    let dir = Utf8TempDir::new().unwrap();
    let config = test_config(dir.path());
    let running = PlatformVersion::new(6, 0);

    // A hand-built 5.0-era archive: proposals still carry the bc- filename
    // prefix and the nova_dashboard barclamp still exists.
    let tree = dir.path().join("old-tree");
    write(&tree.join("crowbar/version"), "5.0\n");
    write(
        &tree.join("knife/data_bags/crowbar/bc-database-default.json"),
        r#"{"id": "bc-database", "attributes": {}}"#,
    );
    write(
        &tree.join("knife/data_bags/crowbar/bc-template-nova_dashboard.json"),
        r#"{"id": "bc-template-nova_dashboard"}"#,
    );
    write(&tree.join("knife/data_bags/barclamps/database.json"), "{}");
    let archive_path = dir.path().join("old-backup.tar.gz");
    archive::compress(&tree, &archive_path).unwrap();

    let target = MemStore::new();
    let mut restore = Restore::prepare(
        &log(),
        &config,
        &target,
        &archive_path,
        RestoreMode::Complete,
    )
    .unwrap();
    restore.validate().unwrap();
    assert!(restore.needs_upgrade(running).unwrap());
    restore.upgrade(running).unwrap();

    // The migrated tree no longer contains old-format filenames, and the
    // rewritten content no longer references the old names.
    let proposals = restore.workdir().unwrap().join("knife/data_bags/crowbar");
    assert!(!proposals.join("bc-database-default.json").exists());
    let database = std::fs::read_to_string(
        proposals.join("database-default.json"),
    )
    .unwrap();
    assert!(!database.contains("bc-"));
    assert!(!proposals
        .join("bc-template-nova_dashboard.json")
        .exists());
    let template = std::fs::read_to_string(
        proposals.join("template-horizon.json"),
    )
    .unwrap();
    assert!(!template.contains("nova_dashboard"));

    let summary = restore.restore().unwrap();
    restore.cleanup();

    // The migrated database proposal loads; the template never does.
    assert_eq!(summary.proposals, 1);
    let proposal = target.proposal("database", "default").unwrap();
    assert_eq!(proposal["id"], "database");
    assert!(target.proposal("horizon", "default").is_none());
}

#[test]
fn archive_without_version_marker_never_restores() {
    let dir = Utf8TempDir::new().unwrap();
    let config = test_config(dir.path());

    let tree = dir.path().join("foreign-tree");
    write(&tree.join("knife/nodes/node1.json"), "{}");
    let archive_path = dir.path().join("foreign.tar.gz");
    archive::compress(&tree, &archive_path).unwrap();

    let target = MemStore::new();
    let mut restore = Restore::prepare(
        &log(),
        &config,
        &target,
        &archive_path,
        RestoreMode::Complete,
    )
    .unwrap();
    assert!(restore.validate().is_err());

    // The gate failed; the operator aborts and cleans up without loading.
    restore.cleanup();
    assert_eq!(target.record_names(RecordKind::Node).len(), 0);
}

fn write(path: &Utf8PathBuf, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}
