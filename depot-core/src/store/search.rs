//! Attribute search: progressive set intersection over the Attributes table.

use rusqlite::{params, Connection};
use std::collections::BTreeSet;

use crate::artifact::ArtifactKind;
use crate::error::Result;

type Key = (String, String);

/// Return the `(uid, version_id)` pairs of `kind` whose attribute rows
/// satisfy every predicate. Names and values compare case-insensitively.
///
/// Starts from the universe of pairs of that kind and intersects it with the
/// match set of each predicate in turn, returning early the moment the
/// running result is empty. With zero predicates the universe is returned
/// unnarrowed (match-all).
pub(super) fn attribute_search(
    conn: &Connection,
    kind: ArtifactKind,
    predicates: &[(String, String)],
) -> Result<BTreeSet<Key>> {
    let mut result: BTreeSet<Key> = {
        let sql = format!("SELECT DISTINCT uid, version_id FROM {}", kind.table());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    let mut stmt = conn.prepare(
        "SELECT uid, version_id FROM Attributes \
         WHERE name = ?1 COLLATE NOCASE AND value = ?2 COLLATE NOCASE",
    )?;

    for (name, value) in predicates {
        let matches: BTreeSet<Key> = stmt
            .query_map(params![name, value], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;

        result = result.intersection(&matches).cloned().collect();
        if result.is_empty() {
            return Ok(result);
        }
    }

    Ok(result)
}
