//! Cross-cutting catalog store scenarios.

use pretty_assertions::assert_eq;
use rusqlite::params;
use tempfile::TempDir;

use super::CatalogStore;
use crate::artifact::{Artifact, ArtifactKind, AttributeRecord, AttributeType, FileRecord};

fn make_artifact(kind: ArtifactKind, uid: &str, version_id: &str, name: &str) -> Artifact {
    Artifact {
        uid: uid.to_string(),
        version_id: version_id.to_string(),
        kind,
        name: name.to_string(),
        description: format!("{name} description"),
        modeler_description: match kind {
            ArtifactKind::Measure => Some(format!("{name} modeler notes")),
            ArtifactKind::Component => None,
        },
        attributes: vec![AttributeRecord {
            name: "R-Value".to_string(),
            value: "30".to_string(),
            unit: Some("ft^2*h*R/Btu".to_string()),
            attribute_type: AttributeType::Double,
        }],
        files: vec![FileRecord {
            filename: "measure.rb".to_string(),
            filetype: "rb".to_string(),
            usage_type: Some("script".to_string()),
            checksum: None,
        }],
    }
}

/// Route catalog logs through the test writer; failures reduce to logged
/// `false`/`None`, so the log is where the cause shows up.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("depot_core=debug")
        .with_test_writer()
        .try_init();
}

fn open_store(dir: &TempDir) -> CatalogStore {
    init_tracing();
    CatalogStore::open(dir.path()).unwrap()
}

#[test]
fn add_then_get_round_trips() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let artifact = make_artifact(ArtifactKind::Measure, "u1", "v1", "Roof-R30");
    assert!(store.add(&artifact));

    let loaded = store.get(ArtifactKind::Measure, "u1", Some("v1")).unwrap();
    assert_eq!(loaded.uid, artifact.uid);
    assert_eq!(loaded.version_id, artifact.version_id);
    assert_eq!(loaded.name, artifact.name);
    assert_eq!(loaded.description, artifact.description);
    assert_eq!(loaded.attributes, artifact.attributes);
    assert_eq!(loaded.files, artifact.files);
}

#[test]
fn add_is_last_writer_wins() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let first = make_artifact(ArtifactKind::Component, "u1", "v1", "Old Name");
    let second = make_artifact(ArtifactKind::Component, "u1", "v1", "New Name");
    assert!(store.add(&first));
    assert!(store.add(&second));

    let loaded = store.get(ArtifactKind::Component, "u1", Some("v1")).unwrap();
    assert_eq!(loaded.name, "New Name");

    // Exactly one row-set for the key.
    assert_eq!(store.artifacts(ArtifactKind::Component).len(), 1);
    assert_eq!(loaded.attributes.len(), 1);
    assert_eq!(loaded.files.len(), 1);
}

#[test]
fn add_rejects_empty_identifiers() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let mut artifact = make_artifact(ArtifactKind::Component, "", "v1", "NoUid");
    assert!(!store.add(&artifact));

    artifact.uid = "u1".to_string();
    artifact.version_id = String::new();
    assert!(!store.add(&artifact));

    assert!(store.artifacts(ArtifactKind::Component).is_empty());
}

#[test]
fn versionless_get_prefers_most_recently_modified() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add(&make_artifact(ArtifactKind::Measure, "u1", "va", "First"));
    store.add(&make_artifact(ArtifactKind::Measure, "u1", "vb", "Second"));

    let loaded = store.get(ArtifactKind::Measure, "u1", None).unwrap();
    assert_eq!(loaded.version_id, "vb");
}

#[test]
fn versionless_get_tie_breaks_on_version_id() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add(&make_artifact(ArtifactKind::Component, "u1", "va", "First"));
    store.add(&make_artifact(ArtifactKind::Component, "u1", "vb", "Second"));

    // Force identical modification times; the lexicographically highest
    // version_id must win.
    store
        .conn_mut()
        .execute("UPDATE Components SET date_modified = ?1", params!["2026-01-01T00:00:00Z"])
        .unwrap();

    let loaded = store.get(ArtifactKind::Component, "u1", None).unwrap();
    assert_eq!(loaded.version_id, "vb");
}

#[test]
fn remove_only_version_collects_uid_directory() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let artifact = make_artifact(ArtifactKind::Component, "u1", "v1", "Solo");
    store.add(&artifact);
    let version_dir = artifact.directory(store.library_root());
    std::fs::create_dir_all(&version_dir).unwrap();

    assert!(store.remove(&artifact));
    assert!(!version_dir.exists());
    assert!(!store.library_root().join("u1").exists());
    assert!(store.get(ArtifactKind::Component, "u1", Some("v1")).is_none());
}

#[test]
fn remove_one_of_two_versions_keeps_sibling() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let v1 = make_artifact(ArtifactKind::Component, "u1", "v1", "Keep");
    let v2 = make_artifact(ArtifactKind::Component, "u1", "v2", "Drop");
    store.add(&v1);
    store.add(&v2);
    std::fs::create_dir_all(v1.directory(store.library_root())).unwrap();
    std::fs::create_dir_all(v2.directory(store.library_root())).unwrap();

    assert!(store.remove(&v2));
    assert!(!v2.directory(store.library_root()).exists());
    assert!(v1.directory(store.library_root()).exists());
    assert!(store.get(ArtifactKind::Component, "u1", Some("v1")).is_some());
}

#[test]
fn remove_outdated_keeps_current_version() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add(&make_artifact(ArtifactKind::Measure, "u1", "v1", "Old"));
    store.add(&make_artifact(ArtifactKind::Measure, "u1", "v2", "Current"));
    store.add(&make_artifact(ArtifactKind::Measure, "u2", "v1", "Other"));

    let removed = store.remove_outdated(ArtifactKind::Measure, "u1", "v2");
    assert_eq!(removed, 1);
    assert!(store.get(ArtifactKind::Measure, "u1", Some("v2")).is_some());
    assert!(store.get(ArtifactKind::Measure, "u1", Some("v1")).is_none());
    assert!(store.get(ArtifactKind::Measure, "u2", Some("v1")).is_some());
}

#[test]
fn text_search_is_case_insensitive_substring() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add(&make_artifact(ArtifactKind::Measure, "u1", "v1", "Roof-R30"));
    store.add(&make_artifact(ArtifactKind::Measure, "u2", "v1", "Wall Insulation"));

    let hits = store.search(ArtifactKind::Measure, "roof");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uid, "u1");

    // Matches modeler description too.
    let hits = store.search(ArtifactKind::Measure, "modeler notes");
    assert_eq!(hits.len(), 2);

    assert!(store.search(ArtifactKind::Measure, "chiller").is_empty());
}

#[test]
fn text_search_treats_like_metacharacters_literally() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add(&make_artifact(ArtifactKind::Component, "u1", "v1", "100% Outdoor Air"));
    store.add(&make_artifact(ArtifactKind::Component, "u2", "v1", "Plain Damper"));

    let hits = store.search(ArtifactKind::Component, "100%");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uid, "u1");
}

#[test]
fn attribute_search_scenario() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let mut artifact = make_artifact(ArtifactKind::Component, "u1", "v1", "Roof-R30");
    artifact.attributes = vec![AttributeRecord::string("R-Value", "30")];
    store.add(&artifact);

    let hits = store.attribute_search(
        ArtifactKind::Component,
        &[("R-Value".to_string(), "30".to_string())],
    );
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uid, "u1");
    assert_eq!(hits[0].version_id, "v1");

    let hits = store.attribute_search(
        ArtifactKind::Component,
        &[
            ("R-Value".to_string(), "30".to_string()),
            ("Type".to_string(), "Wall".to_string()),
        ],
    );
    assert!(hits.is_empty());
}

#[test]
fn attribute_search_is_case_insensitive() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let mut artifact = make_artifact(ArtifactKind::Component, "u1", "v1", "Roof");
    artifact.attributes = vec![AttributeRecord::string("Construction", "Metal Deck")];
    store.add(&artifact);

    let hits = store.attribute_search(
        ArtifactKind::Component,
        &[("construction".to_string(), "metal deck".to_string())],
    );
    assert_eq!(hits.len(), 1);
}

#[test]
fn attribute_search_narrows_monotonically() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    for (uid, attrs) in [
        ("u1", vec![("A", "1"), ("B", "2")]),
        ("u2", vec![("A", "1")]),
        ("u3", vec![("B", "2")]),
    ] {
        let mut artifact = make_artifact(ArtifactKind::Component, uid, "v1", uid);
        artifact.attributes = attrs
            .into_iter()
            .map(|(n, v)| AttributeRecord::string(n, v))
            .collect();
        store.add(&artifact);
    }

    let one = store.attribute_search(ArtifactKind::Component, &[("A".to_string(), "1".to_string())]);
    let two = store.attribute_search(
        ArtifactKind::Component,
        &[("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())],
    );

    assert_eq!(one.len(), 2);
    assert_eq!(two.len(), 1);
    for hit in &two {
        assert!(one.iter().any(|a| a.uid == hit.uid && a.version_id == hit.version_id));
    }
}

#[test]
fn attribute_search_with_no_predicates_matches_all_of_kind() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add(&make_artifact(ArtifactKind::Component, "u1", "v1", "One"));
    store.add(&make_artifact(ArtifactKind::Component, "u2", "v1", "Two"));
    store.add(&make_artifact(ArtifactKind::Measure, "u3", "v1", "Other kind"));

    let hits = store.attribute_search(ArtifactKind::Component, &[]);
    assert_eq!(hits.len(), 2);
}

#[test]
fn uids_deduplicate_versions_within_a_kind() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add(&make_artifact(ArtifactKind::Measure, "u1", "v1", "First"));
    store.add(&make_artifact(ArtifactKind::Measure, "u1", "v2", "Second"));
    store.add(&make_artifact(ArtifactKind::Measure, "u2", "v1", "Other"));
    store.add(&make_artifact(ArtifactKind::Component, "u3", "v1", "Different kind"));

    let mut uids = store.uids(ArtifactKind::Measure);
    uids.sort();
    assert_eq!(uids, vec!["u1".to_string(), "u2".to_string()]);
    assert_eq!(store.uids(ArtifactKind::Component), vec!["u3".to_string()]);
}

#[test]
fn auth_keys_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open_store(&dir);
        assert!(store.set_prod_auth_key("0123456789abcdef0123456789abcdef"));
        assert!(store.set_dev_auth_key("fedcba9876543210fedcba9876543210"));
    }

    let store = open_store(&dir);
    assert_eq!(store.prod_auth_key(), "0123456789abcdef0123456789abcdef");
    assert_eq!(store.dev_auth_key(), "fedcba9876543210fedcba9876543210");
}

#[test]
fn reopening_current_store_is_a_no_op_migration() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open_store(&dir);
        store.add(&make_artifact(ArtifactKind::Measure, "u1", "v1", "Keep me"));
        assert_eq!(store.schema_version().as_deref(), Some(super::CURRENT_SCHEMA_VERSION));
    }

    // Second open runs the migrator again; rows must survive untouched.
    let store = open_store(&dir);
    assert_eq!(store.schema_version().as_deref(), Some(super::CURRENT_SCHEMA_VERSION));
    assert!(store.get(ArtifactKind::Measure, "u1", Some("v1")).is_some());
}

#[test]
fn open_fails_on_unknown_schema_version() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join(super::DB_FILENAME);
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Settings (name VARCHAR, data VARCHAR);
         INSERT INTO Settings VALUES ('dbVersion', '0.9');",
    )
    .unwrap();
    drop(conn);

    assert!(CatalogStore::open(dir.path()).is_err());
}

/// Build an on-disk 1.2-era store: row-based settings, unversioned child
/// tables, components whose content is nested one directory too deep.
fn seed_v12_store(dir: &TempDir) {
    let conn = rusqlite::Connection::open(dir.path().join(super::DB_FILENAME)).unwrap();
    conn.execute_batch(
        "CREATE TABLE Settings (name VARCHAR, data VARCHAR);
         INSERT INTO Settings VALUES ('dbVersion', '1.2');
         INSERT INTO Settings VALUES ('prodAuthKey', 'legacykey');
         INSERT INTO Settings VALUES ('devAuthKey', '');
         CREATE TABLE Components (uid VARCHAR, version_id VARCHAR, name VARCHAR, \
             type VARCHAR, date_added DATETIME, date_modified DATETIME, directory VARCHAR);
         INSERT INTO Components VALUES ('u1', 'v1', 'Legacy Roof', 'A legacy roof', \
             '2020-01-01T00:00:00Z', '2020-01-01T00:00:00Z', 'Legacy Roof/');
         CREATE TABLE Files (uid VARCHAR, filename VARCHAR, filetype VARCHAR);
         INSERT INTO Files VALUES ('u1', 'roof.idf', 'idf');
         CREATE TABLE Attributes (uid VARCHAR, name VARCHAR, value VARCHAR, \
             units VARCHAR, type VARCHAR);
         INSERT INTO Attributes VALUES ('u1', 'R-Value', '30', '', 'varchar');",
    )
    .unwrap();

    let nested = dir.path().join("u1").join("v1").join("Legacy Roof");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(nested.join("roof.idf"), "! idf content").unwrap();
    std::fs::write(dir.path().join("u1/v1/README.txt"), "strip me").unwrap();
}

#[test]
fn migrates_v12_store_to_current() {
    let dir = TempDir::new().unwrap();
    seed_v12_store(&dir);

    let store = open_store(&dir);
    assert_eq!(store.schema_version().as_deref(), Some(super::CURRENT_SCHEMA_VERSION));
    assert_eq!(store.prod_auth_key(), "legacykey");

    // Rows survived; the legacy `type` column became the description and
    // child rows gained the parent's version_id.
    let loaded = store.get(ArtifactKind::Component, "u1", Some("v1")).unwrap();
    assert_eq!(loaded.name, "Legacy Roof");
    assert_eq!(loaded.description, "A legacy roof");
    assert_eq!(loaded.files.len(), 1);
    assert_eq!(loaded.attributes.len(), 1);
    assert_eq!(loaded.attributes[0].attribute_type, AttributeType::String);

    let hits = store.attribute_search(
        ArtifactKind::Component,
        &[("R-Value".to_string(), "30".to_string())],
    );
    assert_eq!(hits.len(), 1);

    // Content hoisted one level; non-essential files stripped.
    let version_dir = dir.path().join("u1").join("v1");
    assert!(version_dir.join("roof.idf").is_file());
    assert!(!version_dir.join("Legacy Roof").exists());
    assert!(!version_dir.join("README.txt").exists());
}

/// Build an on-disk 1.0-era store: column-based settings holding the single
/// legacy consumer key, Components without timestamps, unversioned child
/// tables, nested content.
fn seed_v10_store(dir: &TempDir) {
    let conn = rusqlite::Connection::open(dir.path().join(super::DB_FILENAME)).unwrap();
    conn.execute_batch(
        "CREATE TABLE Settings (oauthConsumerKey VARCHAR, dbVersion VARCHAR);
         INSERT INTO Settings VALUES ('legacyconsumerkey', '1.0');
         CREATE TABLE Components (uid VARCHAR, version_id VARCHAR, name VARCHAR, \
             type VARCHAR, directory VARCHAR);
         INSERT INTO Components VALUES ('u1', 'v1', 'Legacy Roof', 'A legacy roof', \
             'Legacy Roof/');
         CREATE TABLE Files (uid VARCHAR, filename VARCHAR, filetype VARCHAR);
         INSERT INTO Files VALUES ('u1', 'roof.idf', 'idf');
         CREATE TABLE Attributes (uid VARCHAR, name VARCHAR, value VARCHAR, \
             units VARCHAR, type VARCHAR);
         INSERT INTO Attributes VALUES ('u1', 'R-Value', '30', '', 'varchar');",
    )
    .unwrap();

    let nested = dir.path().join("u1").join("v1").join("Legacy Roof");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(nested.join("roof.idf"), "! idf content").unwrap();
}

#[test]
fn migrates_v10_store_through_the_full_chain() {
    let dir = TempDir::new().unwrap();
    seed_v10_store(&dir);

    let store = open_store(&dir);
    assert_eq!(store.schema_version().as_deref(), Some(super::CURRENT_SCHEMA_VERSION));

    // The single legacy consumer key becomes the production auth key; the
    // development key starts empty.
    assert_eq!(store.prod_auth_key(), "legacyconsumerkey");
    assert_eq!(store.dev_auth_key(), "");

    let loaded = store.get(ArtifactKind::Component, "u1", Some("v1")).unwrap();
    assert_eq!(loaded.name, "Legacy Roof");
    assert_eq!(loaded.description, "A legacy roof");
    assert_eq!(loaded.files.len(), 1);
    assert_eq!(loaded.attributes.len(), 1);
    assert_eq!(loaded.attributes[0].attribute_type, AttributeType::String);

    let version_dir = dir.path().join("u1").join("v1");
    assert!(version_dir.join("roof.idf").is_file());
    assert!(!version_dir.join("Legacy Roof").exists());
}

#[test]
fn migrating_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    seed_v12_store(&dir);

    {
        let store = open_store(&dir);
        assert_eq!(store.schema_version().as_deref(), Some(super::CURRENT_SCHEMA_VERSION));
    }
    // Second run must find nothing to do and leave the data intact.
    let store = open_store(&dir);
    assert_eq!(store.schema_version().as_deref(), Some(super::CURRENT_SCHEMA_VERSION));
    assert!(store.get(ArtifactKind::Component, "u1", Some("v1")).is_some());
}
