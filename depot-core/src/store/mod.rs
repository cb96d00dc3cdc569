//! Local artifact catalog: durable SQLite index plus content tree.
//!
//! The store owns a library root directory laid out as
//! `{libraryRoot}/{uid}/{versionId}/…` with a `catalog.db` index at the root.
//! It assumes single-process ownership of that directory and is used as one
//! long-lived handle with an explicit open/close lifecycle.
//!
//! Store failures never escape the public surface: operations return
//! `false` / `None` / empty with a log entry, leaving prior state untouched.
//! The single fatal condition is a migration failure at open time.

mod migrate;
mod search;

#[cfg(test)]
mod tests;

pub use migrate::CURRENT_SCHEMA_VERSION;
pub(crate) use migrate::STRIP_FILES;

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::artifact::{Artifact, ArtifactKind, AttributeRecord, AttributeType, FileRecord};
use crate::error::Result;

/// Index database filename inside the library root.
pub const DB_FILENAME: &str = "catalog.db";

/// Durable local index and content-addressed directory tree.
pub struct CatalogStore {
    conn: Connection,
    library_root: PathBuf,
    prod_auth_key: String,
    dev_auth_key: String,
}

impl CatalogStore {
    /// Open (or create) the catalog at the given library root.
    ///
    /// Creates the directory and a fresh index when missing, then brings an
    /// existing index up to [`CURRENT_SCHEMA_VERSION`]. A migration failure
    /// is fatal: the store cannot be opened, and the index is left at its
    /// prior (still valid) version.
    pub fn open(library_root: impl AsRef<Path>) -> Result<Self> {
        let library_root = library_root.as_ref();
        if !library_root.is_dir() {
            std::fs::create_dir_all(library_root)?;
        }
        // Canonicalize only once the directory exists, so collaborators
        // comparing roots see one spelling of the path.
        let library_root = library_root.canonicalize()?;

        let db_path = library_root.join(DB_FILENAME);
        let fresh = !db_path.exists();

        let mut conn = Connection::open(&db_path)?;

        if fresh {
            migrate::initialize_schema(&mut conn)?;
        }
        migrate::SchemaMigrator::new(&mut conn, &library_root).run()?;

        let prod_auth_key = read_setting(&conn, "prodAuthKey")?.unwrap_or_default();
        let dev_auth_key = read_setting(&conn, "devAuthKey")?.unwrap_or_default();

        tracing::debug!("Opened catalog store at {}", library_root.display());

        Ok(Self {
            conn,
            library_root,
            prod_auth_key,
            dev_auth_key,
        })
    }

    /// Close the store, releasing the index connection.
    pub fn close(self) {
        // Connection closes on drop; kept explicit for lifecycle clarity.
        drop(self);
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    pub fn db_path(&self) -> PathBuf {
        self.library_root.join(DB_FILENAME)
    }

    /// Look up one artifact revision.
    ///
    /// With `version_id` omitted, resolves to the revision with the most
    /// recent `date_modified`, tie-broken by highest `version_id` — a
    /// deterministic rule applied to both kinds.
    pub fn get(&self, kind: ArtifactKind, uid: &str, version_id: Option<&str>) -> Option<Artifact> {
        if uid.trim().is_empty() || version_id.is_some_and(|v| v.trim().is_empty()) {
            tracing::warn!("get rejected: empty identifier");
            return None;
        }

        match self.get_inner(kind, uid, version_id) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("get({kind}, {uid}) failed: {e}");
                None
            }
        }
    }

    fn get_inner(
        &self,
        kind: ArtifactKind,
        uid: &str,
        version_id: Option<&str>,
    ) -> Result<Option<Artifact>> {
        let version_id = match version_id {
            Some(v) => Some(v.to_string()),
            None => self.resolve_latest_version(kind, uid)?,
        };
        let Some(version_id) = version_id else {
            return Ok(None);
        };
        self.load_artifact(kind, uid, &version_id)
    }

    fn resolve_latest_version(&self, kind: ArtifactKind, uid: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT version_id FROM {} WHERE uid = ?1 \
             ORDER BY date_modified DESC, version_id DESC LIMIT 1",
            kind.table()
        );
        Ok(self
            .conn
            .query_row(&sql, params![uid], |row| row.get::<_, String>(0))
            .optional()?)
    }

    fn load_artifact(&self, kind: ArtifactKind, uid: &str, version_id: &str) -> Result<Option<Artifact>> {
        let head = match kind {
            ArtifactKind::Component => self
                .conn
                .query_row(
                    "SELECT name, description FROM Components WHERE uid = ?1 AND version_id = ?2",
                    params![uid, version_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, None)),
                )
                .optional()?,
            ArtifactKind::Measure => self
                .conn
                .query_row(
                    "SELECT name, description, modeler_description FROM Measures \
                     WHERE uid = ?1 AND version_id = ?2",
                    params![uid, version_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?,
        };

        let Some((name, description, modeler_description)) = head else {
            return Ok(None);
        };

        Ok(Some(Artifact {
            uid: uid.to_string(),
            version_id: version_id.to_string(),
            kind,
            name,
            description,
            modeler_description,
            attributes: self.load_attributes(uid, version_id)?,
            files: self.load_files(uid, version_id)?,
        }))
    }

    fn load_attributes(&self, uid: &str, version_id: &str) -> Result<Vec<AttributeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, value, units, type FROM Attributes WHERE uid = ?1 AND version_id = ?2",
        )?;
        let rows = stmt.query_map(params![uid, version_id], |row| {
            Ok(AttributeRecord {
                name: row.get(0)?,
                value: row.get(1)?,
                unit: row.get::<_, Option<String>>(2)?.filter(|u| !u.is_empty()),
                attribute_type: AttributeType::parse(&row.get::<_, String>(3)?),
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn load_files(&self, uid: &str, version_id: &str) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT filename, filetype, usage_type, checksum FROM Files \
             WHERE uid = ?1 AND version_id = ?2",
        )?;
        let rows = stmt.query_map(params![uid, version_id], |row| {
            Ok(FileRecord {
                filename: row.get(0)?,
                filetype: row.get(1)?,
                usage_type: row.get::<_, Option<String>>(2)?.filter(|u| !u.is_empty()),
                checksum: row.get::<_, Option<String>>(3)?.filter(|c| !c.is_empty()),
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Register an artifact revision in the index.
    ///
    /// Delete-then-insert inside one transaction: any existing row-set for
    /// the same `(uid, versionId)` is replaced wholesale (last writer wins),
    /// and any failure rolls the whole operation back.
    pub fn add(&mut self, artifact: &Artifact) -> bool {
        if let Err(e) = artifact.validate_ids() {
            tracing::warn!("add rejected: {e}");
            return false;
        }

        match self.add_inner(artifact) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "add({}, {}/{}) failed, rolled back: {e}",
                    artifact.kind,
                    artifact.uid,
                    artifact.version_id
                );
                false
            }
        }
    }

    fn add_inner(&mut self, artifact: &Artifact) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;

        let table = artifact.kind.table();
        tx.execute(
            &format!("DELETE FROM {table} WHERE uid = ?1 AND version_id = ?2"),
            params![artifact.uid, artifact.version_id],
        )?;
        match artifact.kind {
            ArtifactKind::Component => {
                tx.execute(
                    "INSERT INTO Components (uid, version_id, name, description, date_added, date_modified) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![artifact.uid, artifact.version_id, artifact.name, artifact.description, now],
                )?;
            }
            ArtifactKind::Measure => {
                tx.execute(
                    "INSERT INTO Measures (uid, version_id, name, description, modeler_description, \
                     date_added, date_modified) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        artifact.uid,
                        artifact.version_id,
                        artifact.name,
                        artifact.description,
                        artifact.modeler_description.clone().unwrap_or_default(),
                        now
                    ],
                )?;
            }
        }

        tx.execute(
            "DELETE FROM Files WHERE uid = ?1 AND version_id = ?2",
            params![artifact.uid, artifact.version_id],
        )?;
        for file in &artifact.files {
            tx.execute(
                "INSERT INTO Files (uid, version_id, filename, filetype, usage_type, checksum) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    artifact.uid,
                    artifact.version_id,
                    file.filename,
                    file.filetype,
                    file.usage_type.clone().unwrap_or_default(),
                    file.checksum.clone().unwrap_or_default()
                ],
            )?;
        }

        tx.execute(
            "DELETE FROM Attributes WHERE uid = ?1 AND version_id = ?2",
            params![artifact.uid, artifact.version_id],
        )?;
        for attr in &artifact.attributes {
            tx.execute(
                "INSERT INTO Attributes (uid, version_id, name, value, units, type) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    artifact.uid,
                    artifact.version_id,
                    attr.name,
                    attr.value,
                    attr.unit.clone().unwrap_or_default(),
                    attr.attribute_type.as_str()
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove an artifact revision from the index and from disk.
    ///
    /// Index rows go first, in one transaction; only after the commit is the
    /// version directory deleted. When the parent `uid` directory holds
    /// exactly this one version, the parent is removed instead of leaving an
    /// orphaned single-child shell.
    pub fn remove(&mut self, artifact: &Artifact) -> bool {
        if let Err(e) = artifact.validate_ids() {
            tracing::warn!("remove rejected: {e}");
            return false;
        }

        if let Err(e) = self.remove_rows(artifact) {
            tracing::error!(
                "remove({}, {}/{}) failed, rolled back, directory untouched: {e}",
                artifact.kind,
                artifact.uid,
                artifact.version_id
            );
            return false;
        }

        if let Err(e) = self.remove_directory(artifact) {
            tracing::error!(
                "remove({}/{}): index rows deleted but directory removal failed: {e}",
                artifact.uid,
                artifact.version_id
            );
            return false;
        }

        true
    }

    fn remove_rows(&mut self, artifact: &Artifact) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE uid = ?1 AND version_id = ?2",
                artifact.kind.table()
            ),
            params![artifact.uid, artifact.version_id],
        )?;
        tx.execute(
            "DELETE FROM Files WHERE uid = ?1 AND version_id = ?2",
            params![artifact.uid, artifact.version_id],
        )?;
        tx.execute(
            "DELETE FROM Attributes WHERE uid = ?1 AND version_id = ?2",
            params![artifact.uid, artifact.version_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove_directory(&self, artifact: &Artifact) -> Result<()> {
        let version_dir = artifact.directory(&self.library_root);
        let uid_dir = self.library_root.join(&artifact.uid);

        if !uid_dir.is_dir() {
            return Ok(());
        }

        let version_dirs = std::fs::read_dir(&uid_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .count();

        // One remaining version directory means it is the one being removed:
        // delete the parent so no empty uid shell is left behind.
        let target = if version_dirs == 1 { uid_dir } else { version_dir };
        if target.is_dir() {
            std::fs::remove_dir_all(&target)?;
        }
        Ok(())
    }

    /// Remove every revision of `uid` except `current_version_id`.
    /// Returns the number of revisions removed.
    pub fn remove_outdated(&mut self, kind: ArtifactKind, uid: &str, current_version_id: &str) -> usize {
        let outdated: Vec<Artifact> = self
            .artifacts(kind)
            .into_iter()
            .filter(|a| a.uid == uid && a.version_id != current_version_id)
            .collect();

        outdated.iter().filter(|a| self.remove(a)).count()
    }

    /// All artifact revisions of a kind.
    pub fn artifacts(&self, kind: ArtifactKind) -> Vec<Artifact> {
        match self.keys_of(kind, None) {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|(uid, version_id)| self.get(kind, &uid, Some(&version_id)))
                .collect(),
            Err(e) => {
                tracing::error!("artifacts({kind}) failed: {e}");
                Vec::new()
            }
        }
    }

    /// Distinct uids of a kind.
    pub fn uids(&self, kind: ArtifactKind) -> Vec<String> {
        let sql = format!("SELECT DISTINCT uid FROM {}", kind.table());
        let result: Result<Vec<String>> = (|| {
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<std::result::Result<_, _>>()?)
        })();
        result.unwrap_or_else(|e| {
            tracing::error!("uids({kind}) failed: {e}");
            Vec::new()
        })
    }

    fn keys_of(&self, kind: ArtifactKind, like: Option<&str>) -> Result<Vec<(String, String)>> {
        let mut sql = format!("SELECT uid, version_id FROM {}", kind.table());
        if like.is_some() {
            sql.push_str(" WHERE name LIKE ?1 ESCAPE '\\' OR description LIKE ?1 ESCAPE '\\'");
            if kind == ArtifactKind::Measure {
                sql.push_str(" OR modeler_description LIKE ?1 ESCAPE '\\'");
            }
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let map = |row: &rusqlite::Row<'_>| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
        let rows = match like {
            Some(pattern) => stmt.query_map(params![pattern], map)?,
            None => stmt.query_map([], map)?,
        };
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Case-insensitive substring search over name and description
    /// (plus modeler description for measures).
    pub fn search(&self, kind: ArtifactKind, text: &str) -> Vec<Artifact> {
        let pattern = format!("%{}%", escape_like(text));
        match self.keys_of(kind, Some(&pattern)) {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|(uid, version_id)| self.get(kind, &uid, Some(&version_id)))
                .collect(),
            Err(e) => {
                tracing::error!("search({kind}, {text:?}) failed: {e}");
                Vec::new()
            }
        }
    }

    /// Multi-predicate attribute search over the Attributes table:
    /// progressive set intersection with an early exit on empty.
    pub fn attribute_search(&self, kind: ArtifactKind, predicates: &[(String, String)]) -> Vec<Artifact> {
        match search::attribute_search(&self.conn, kind, predicates) {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|(uid, version_id)| self.get(kind, &uid, Some(&version_id)))
                .collect(),
            Err(e) => {
                tracing::error!("attribute_search({kind}) failed: {e}");
                Vec::new()
            }
        }
    }

    // ---- Settings -------------------------------------------------------

    pub fn prod_auth_key(&self) -> &str {
        &self.prod_auth_key
    }

    pub fn dev_auth_key(&self) -> &str {
        &self.dev_auth_key
    }

    /// Persist the production auth key. Validation against the registry is
    /// the `RegistryClient`'s job; see `SyncCoordinator::set_auth_key`.
    pub fn set_prod_auth_key(&mut self, key: &str) -> bool {
        match self.write_setting("prodAuthKey", key) {
            Ok(()) => {
                self.prod_auth_key = key.to_string();
                true
            }
            Err(e) => {
                tracing::error!("Cannot update prodAuthKey, rolled back: {e}");
                false
            }
        }
    }

    /// Persist the development auth key.
    pub fn set_dev_auth_key(&mut self, key: &str) -> bool {
        match self.write_setting("devAuthKey", key) {
            Ok(()) => {
                self.dev_auth_key = key.to_string();
                true
            }
            Err(e) => {
                tracing::error!("Cannot update devAuthKey, rolled back: {e}");
                false
            }
        }
    }

    fn write_setting(&mut self, name: &str, data: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE Settings SET data = ?2 WHERE name = ?1",
            params![name, data],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Persisted schema version of the open index.
    pub fn schema_version(&self) -> Option<String> {
        read_setting(&self.conn, "dbVersion").ok().flatten()
    }

    #[cfg(test)]
    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

fn read_setting(conn: &Connection, name: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT data FROM Settings WHERE name = ?1",
            params![name],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

/// Escape LIKE metacharacters so user text matches literally.
fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
