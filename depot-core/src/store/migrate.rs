//! Index schema migrations.
//!
//! The index carries its schema version in `Settings`. `SchemaMigrator`
//! applies an ordered chain of `Migration` steps in a loop until the index
//! reaches [`CURRENT_SCHEMA_VERSION`]; each step runs inside one transaction,
//! so a failed step rolls back and leaves the index at the prior (still
//! valid) version. Running against an up-to-date index is a no-op.
//!
//! History:
//! - 1.0/1.1 → 1.2: the settings table is rebuilt as name/data rows and the
//!   single legacy consumer key becomes the production auth key, alongside a
//!   separate (empty) development key; the primary table gains timestamps.
//! - 1.2 → 1.3: child tables gain `version_id` columns backfilled by joining
//!   against the parent table, content directories move up one level, and
//!   the primary table is rebuilt with its current column set.

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;

use crate::error::{DepotError, Result};

/// Schema version written by a fresh initialization.
pub const CURRENT_SCHEMA_VERSION: &str = "1.3";

/// Non-essential files stripped from artifact content directories, both
/// during pre-1.3 relocation and when registering a downloaded archive.
pub(crate) const STRIP_FILES: &[&str] = &["DISCLAIMER.txt", "README.txt", "output.yaml"];

/// One step of the migration chain.
struct Migration {
    /// Versions this step upgrades from.
    applies_to: &'static [&'static str],
    /// Version the index is at once the step commits.
    to: &'static str,
    apply: fn(&Transaction<'_>, &Path) -> anyhow::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        applies_to: &["1.0", "1.1"],
        to: "1.2",
        apply: migrate_settings_rows,
    },
    Migration {
        applies_to: &["1.2"],
        to: "1.3",
        apply: migrate_versioned_children,
    },
];

/// Create the current schema in an empty index.
pub(super) fn initialize_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE Settings (name VARCHAR, data VARCHAR);
         CREATE TABLE Components (uid VARCHAR, version_id VARCHAR, name VARCHAR, \
             description VARCHAR, date_added DATETIME, date_modified DATETIME);
         CREATE TABLE Measures (uid VARCHAR, version_id VARCHAR, name VARCHAR, \
             description VARCHAR, modeler_description VARCHAR, date_added DATETIME, \
             date_modified DATETIME);
         CREATE TABLE Files (uid VARCHAR, version_id VARCHAR, filename VARCHAR, \
             filetype VARCHAR, usage_type VARCHAR, checksum VARCHAR);
         CREATE TABLE Attributes (uid VARCHAR, version_id VARCHAR, name VARCHAR, \
             value VARCHAR, units VARCHAR, type VARCHAR);",
    )?;

    let mut stmt = tx.prepare("INSERT INTO Settings (name, data) VALUES (?1, ?2)")?;
    for (name, data) in [
        ("dbVersion", CURRENT_SCHEMA_VERSION),
        ("prodAuthKey", ""),
        ("devAuthKey", ""),
    ] {
        stmt.execute(params![name, data])?;
    }
    drop(stmt);

    tx.commit()?;
    Ok(())
}

/// Brings an on-disk index to the current schema version.
pub(super) struct SchemaMigrator<'a> {
    conn: &'a mut Connection,
    library_root: &'a Path,
}

impl<'a> SchemaMigrator<'a> {
    pub(super) fn new(conn: &'a mut Connection, library_root: &'a Path) -> Self {
        Self { conn, library_root }
    }

    /// Apply migration steps until the index reaches the current version.
    pub(super) fn run(self) -> Result<()> {
        loop {
            let version = self.read_version()?;
            if version == CURRENT_SCHEMA_VERSION {
                return Ok(());
            }

            let step = MIGRATIONS
                .iter()
                .find(|m| m.applies_to.contains(&version.as_str()))
                .ok_or_else(|| {
                    DepotError::Store(format!("no migration path from schema version '{version}'"))
                })?;

            tracing::info!("Migrating catalog index {version} -> {}", step.to);

            let tx = self.conn.transaction()?;
            (step.apply)(&tx, self.library_root).map_err(|e| {
                // Transaction rolls back on drop.
                DepotError::Store(format!("migration {version} -> {} failed: {e:#}", step.to))
            })?;
            tx.execute(
                "UPDATE Settings SET data = ?1 WHERE name = 'dbVersion'",
                params![step.to],
            )?;
            tx.commit()?;
        }
    }

    fn read_version(&self) -> Result<String> {
        // Current layout: a name/data row.
        let row = self
            .conn
            .query_row(
                "SELECT data FROM Settings WHERE name = 'dbVersion'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional();
        if let Ok(Some(version)) = row {
            return Ok(version);
        }

        // 1.0/1.1 layout: Settings(oauthConsumerKey, dbVersion) columns.
        let legacy = self
            .conn
            .query_row("SELECT dbVersion FROM Settings", [], |row| {
                row.get::<_, String>(0)
            })
            .optional();
        match legacy {
            Ok(Some(version)) => Ok(version),
            _ => Err(DepotError::Store(
                "cannot determine schema version of catalog index".to_string(),
            )),
        }
    }
}

/// 1.0/1.1 → 1.2: rebuild Settings as name/data rows with split
/// production/development auth keys; add timestamps to Components.
fn migrate_settings_rows(tx: &Transaction<'_>, _library_root: &Path) -> anyhow::Result<()> {
    let consumer_key: Option<String> = tx
        .query_row("SELECT oauthConsumerKey FROM Settings", [], |row| row.get(0))
        .optional()
        .context("reading legacy consumer key")?;

    tx.execute_batch(
        "ALTER TABLE Components ADD date_added DATETIME;
         ALTER TABLE Components ADD date_modified DATETIME;
         DROP TABLE Settings;
         CREATE TABLE Settings (name VARCHAR, data VARCHAR);",
    )
    .context("rebuilding settings table")?;

    let mut stmt = tx.prepare("INSERT INTO Settings (name, data) VALUES (?1, ?2)")?;
    // The version row is overwritten by the migrator after this step commits;
    // written here so the table is complete even in isolation.
    for (name, data) in [
        ("dbVersion", "1.2"),
        ("prodAuthKey", consumer_key.as_deref().unwrap_or_default()),
        ("devAuthKey", ""),
    ] {
        stmt.execute(params![name, data])?;
    }
    Ok(())
}

/// 1.2 → 1.3: add `version_id` to child tables (backfilled from Components),
/// extend Files, create Measures, relocate content directories one level,
/// and rebuild Components with its current columns.
fn migrate_versioned_children(tx: &Transaction<'_>, library_root: &Path) -> anyhow::Result<()> {
    tx.execute_batch(
        "ALTER TABLE Attributes ADD version_id VARCHAR;
         ALTER TABLE Files ADD version_id VARCHAR;
         UPDATE Attributes SET type = 'string' WHERE type = 'varchar';
         ALTER TABLE Files ADD usage_type VARCHAR;
         ALTER TABLE Files ADD checksum VARCHAR;
         CREATE TABLE Measures (uid VARCHAR, version_id VARCHAR, name VARCHAR, \
             description VARCHAR, modeler_description VARCHAR, date_added DATETIME, \
             date_modified DATETIME);",
    )
    .context("extending child tables")?;

    // Backfill child version_id by joining against the parent table. Pre-1.3
    // stores held one version per uid, so the correlated lookup is unique.
    tx.execute_batch(
        "UPDATE Attributes SET version_id = \
             (SELECT c.version_id FROM Components c WHERE c.uid = Attributes.uid);
         UPDATE Files SET version_id = \
             (SELECT c.version_id FROM Components c WHERE c.uid = Files.uid);",
    )
    .context("backfilling child version ids")?;

    relocate_content_dirs(tx, library_root).context("relocating content directories")?;

    // The legacy `type` column carried the description.
    tx.execute_batch(
        "ALTER TABLE Components RENAME TO ComponentsTmp;
         CREATE TABLE Components (uid VARCHAR, version_id VARCHAR, name VARCHAR, \
             description VARCHAR, date_added DATETIME, date_modified DATETIME);
         INSERT INTO Components SELECT uid, version_id, name, type, date_added, date_modified \
             FROM ComponentsTmp;
         DROP TABLE ComponentsTmp;",
    )
    .context("rebuilding primary table")?;

    Ok(())
}

/// Pre-1.3 layouts nested content an extra directory deep
/// (`{root}/{uid}/{versionId}/{name}/…`); hoist it to the version directory
/// and drop known non-essential files.
fn relocate_content_dirs(tx: &Transaction<'_>, library_root: &Path) -> anyhow::Result<()> {
    let mut stmt = tx.prepare("SELECT uid, version_id, directory FROM Components")?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<_, _>>()?;

    for (uid, version_id, directory) in rows {
        let dest = library_root.join(&uid).join(&version_id);
        let dir_name = match Path::new(directory.trim_end_matches(['/', '\\'])).file_name() {
            Some(name) => name.to_owned(),
            None => continue,
        };
        let src = dest.join(dir_name);
        if !src.is_dir() {
            continue;
        }

        for name in STRIP_FILES {
            let _ = std::fs::remove_file(dest.join(name));
        }

        for entry in std::fs::read_dir(&src)? {
            let entry = entry?;
            std::fs::rename(entry.path(), dest.join(entry.file_name()))
                .with_context(|| format!("moving {}", entry.path().display()))?;
        }
        std::fs::remove_dir_all(&src)?;
    }

    Ok(())
}
