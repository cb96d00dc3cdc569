//! Post-fetch pipeline: scratch file, extract, relocate, register.
//!
//! Everything happens inside a `TempDir` that is deleted on every exit path,
//! success or failure. Only the final relocation touches the library root,
//! and a failure before `CatalogStore::add` leaves the store untouched.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;

use crate::artifact::{Artifact, ArtifactManifest, FileRecord, MANIFEST_FILENAME};
use crate::store::{CatalogStore, STRIP_FILES};

/// Extract an artifact archive (tar.gz) and register it into the store.
///
/// The manifest inside the archive is the source of truth for the artifact's
/// kind and identifiers; its directory is relocated to the content-addressed
/// `{libraryRoot}/{uid}/{versionId}` location, replacing any prior content
/// for that revision.
pub(super) fn register_archive(store: &mut CatalogStore, bytes: &[u8]) -> Result<Artifact> {
    let scratch = tempfile::TempDir::new().context("Failed to create scratch directory")?;

    let archive_path = scratch.path().join("artifact.tar.gz");
    std::fs::write(&archive_path, bytes).context("Failed to persist archive to scratch")?;

    let extract_dir = scratch.path().join("extract");
    std::fs::create_dir_all(&extract_dir)?;
    extract_archive(&archive_path, &extract_dir)?;

    let artifact_dir = locate_manifest_dir(&extract_dir)?;

    for name in STRIP_FILES {
        let _ = std::fs::remove_file(artifact_dir.join(name));
    }

    let manifest = ArtifactManifest::from_dir(&artifact_dir)?;
    manifest.validate()?;
    let artifact = manifest.artifact.clone();

    verify_checksums(&artifact_dir, &artifact.files);

    let dest = artifact.directory(store.library_root());
    if dest.exists() {
        std::fs::remove_dir_all(&dest)
            .with_context(|| format!("Failed to clear prior content at {}", dest.display()))?;
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    relocate(&artifact_dir, &dest)?;

    if !store.add(&artifact) {
        // Index and disk must not disagree.
        let _ = std::fs::remove_dir_all(&dest);
        anyhow::bail!(
            "Failed to register {}/{} in the catalog index",
            artifact.uid,
            artifact.version_id
        );
    }

    Ok(artifact)
}

fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest).context("Failed to extract archive")?;
    Ok(())
}

/// Find the directory holding the manifest inside an extracted tree. The
/// archive's internal layout is not fixed; the shallowest manifest wins.
fn locate_manifest_dir(extract_dir: &Path) -> Result<std::path::PathBuf> {
    let mut manifests: Vec<_> = walkdir::WalkDir::new(extract_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILENAME)
        .collect();
    manifests.sort_by_key(|e| e.depth());

    manifests
        .first()
        .and_then(|e| e.path().parent().map(Path::to_path_buf))
        .with_context(|| format!("No {MANIFEST_FILENAME} found in downloaded archive"))
}

/// Compare on-disk content against the checksums the manifest records.
/// Mismatches are logged, not fatal: the manifest row set is still the
/// source of truth for what the revision should contain.
fn verify_checksums(dir: &Path, files: &[FileRecord]) {
    for file in files {
        let Some(expected) = &file.checksum else {
            continue;
        };
        match FileRecord::checksum_of(&dir.join(&file.filename)) {
            Ok(actual) if &actual == expected => {}
            Ok(actual) => {
                tracing::warn!(
                    "Checksum mismatch for {}: expected {expected}, got {actual}",
                    file.filename
                );
            }
            Err(e) => tracing::warn!("Cannot checksum {}: {e:#}", file.filename),
        }
    }
}

/// Move the extracted directory into place. Rename first; scratch space may
/// sit on a different filesystem, in which case fall back to a copy.
fn relocate(src: &Path, dest: &Path) -> Result<()> {
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    copy_dir_all(src, dest).with_context(|| {
        format!(
            "Failed to relocate {} to {}",
            src.display(),
            dest.display()
        )
    })
}

fn copy_dir_all(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactKind, AttributeRecord};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::Builder;
    use tempfile::TempDir;

    /// Build a tar.gz holding one artifact directory with a manifest.
    fn create_test_archive(uid: &str, version_id: &str, extra_files: &[&str]) -> Vec<u8> {
        let staging = TempDir::new().unwrap();
        let pkg_dir = staging.path().join("pkg");
        std::fs::create_dir_all(&pkg_dir).unwrap();

        let mut artifact = Artifact::new(ArtifactKind::Measure, "Roof-R30");
        artifact.uid = uid.to_string();
        artifact.version_id = version_id.to_string();
        artifact.description = "Adds insulation".to_string();
        artifact.attributes = vec![AttributeRecord::string("R-Value", "30")];
        artifact.files = vec![FileRecord {
            filename: "measure.rb".to_string(),
            filetype: "rb".to_string(),
            usage_type: Some("script".to_string()),
            checksum: None,
        }];
        ArtifactManifest::new(artifact).save_to_dir(&pkg_dir).unwrap();

        std::fs::write(pkg_dir.join("measure.rb"), "# measure body").unwrap();
        for name in extra_files {
            std::fs::write(pkg_dir.join(name), "extra").unwrap();
        }

        let mut bytes = Vec::new();
        {
            let encoder = GzEncoder::new(&mut bytes, Compression::default());
            let mut builder = Builder::new(encoder);
            builder.append_dir_all("pkg", &pkg_dir).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        bytes
    }

    #[test]
    fn registers_archive_into_store() {
        let library = TempDir::new().unwrap();
        let mut store = CatalogStore::open(library.path()).unwrap();

        let bytes = create_test_archive("u1", "v1", &["README.txt"]);
        let artifact = register_archive(&mut store, &bytes).unwrap();
        assert_eq!(artifact.uid, "u1");

        let loaded = store.get(ArtifactKind::Measure, "u1", Some("v1")).unwrap();
        assert_eq!(loaded.name, "Roof-R30");
        assert_eq!(loaded.attributes.len(), 1);

        let dest = store.library_root().join("u1").join("v1");
        assert!(dest.join(MANIFEST_FILENAME).is_file());
        assert!(dest.join("measure.rb").is_file());
        assert!(!dest.join("README.txt").exists());
    }

    #[test]
    fn replaces_prior_content_for_same_revision() {
        let library = TempDir::new().unwrap();
        let mut store = CatalogStore::open(library.path()).unwrap();

        let dest = store.library_root().join("u1").join("v1");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        let bytes = create_test_archive("u1", "v1", &[]);
        register_archive(&mut store, &bytes).unwrap();

        assert!(!dest.join("stale.txt").exists());
        assert!(dest.join("measure.rb").is_file());
    }

    #[test]
    fn archive_without_manifest_is_rejected() {
        let library = TempDir::new().unwrap();
        let mut store = CatalogStore::open(library.path()).unwrap();

        let staging = TempDir::new().unwrap();
        std::fs::write(staging.path().join("loose.txt"), "no manifest here").unwrap();
        let mut bytes = Vec::new();
        {
            let encoder = GzEncoder::new(&mut bytes, Compression::default());
            let mut builder = Builder::new(encoder);
            builder.append_dir_all("pkg", staging.path()).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        assert!(register_archive(&mut store, &bytes).is_err());
        assert!(store.artifacts(ArtifactKind::Measure).is_empty());
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        let library = TempDir::new().unwrap();
        let mut store = CatalogStore::open(library.path()).unwrap();

        assert!(register_archive(&mut store, b"not a tarball").is_err());
        assert!(store.artifacts(ArtifactKind::Component).is_empty());
    }
}
