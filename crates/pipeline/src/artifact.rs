//! Content-addressed result storage.
//!
//! Each successful conversion leaves one file in the result directory, named
//! by its content key. The human-facing file name (converter output with the
//! source id stripped) is kept in a durable side table. An artifact counts
//! as present only when both the file and its name record exist.

use std::path::{Path, PathBuf};

use mp3ify_db::{DiskMap, StoreError};

/// A resolved artifact: where it lives and what to call it on download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub name: String,
}

pub struct ArtifactStore {
    dir: PathBuf,
    names: DiskMap<String>,
}

impl ArtifactStore {
    /// Open the store, creating `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>, names_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        Ok(Self {
            dir,
            names: DiskMap::open(names_path)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, content_key: &str) -> PathBuf {
        self.dir.join(content_key)
    }

    pub fn lookup(&self, content_key: &str) -> Option<Artifact> {
        let path = self.path_for(content_key);
        if !path.is_file() {
            return None;
        }
        let name = self.names.get(content_key)?;
        Some(Artifact { path, name })
    }

    /// Move `produced` into the store under `content_key` and record `name`.
    pub fn store(&self, content_key: &str, produced: &Path, name: &str) -> Result<Artifact, StoreError> {
        let path = self.path_for(content_key);
        if let Err(e) = std::fs::rename(produced, &path) {
            // Cross-device moves need a copy.
            tracing::debug!(error = %e, "Rename failed, copying artifact instead");
            std::fs::copy(produced, &path).map_err(|source| io_error(&path, source))?;
            std::fs::remove_file(produced).map_err(|source| io_error(produced, source))?;
        }
        self.names.put(content_key, name.to_string())?;
        Ok(Artifact {
            path,
            name: name.to_string(),
        })
    }

    /// Delete the file and its name record. Returns whether a file existed.
    pub fn remove(&self, content_key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(content_key);
        let removed = match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(source) => return Err(io_error(&path, source)),
        };
        self.names.remove(content_key)?;
        Ok(removed)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Strip a `-{id}` suffix from a produced file's stem, keeping the extension.
///
/// Converters commonly embed the source id in their output name
/// (`Title-abc123.mp3`); the stored display name drops it.
pub fn strip_source_id(file_name: &str, source_id: &str) -> String {
    let suffix = format!("-{source_id}");
    let (stem, ext) = match file_name.rfind('.') {
        Some(dot) if dot > 0 => file_name.split_at(dot),
        _ => (file_name, ""),
    };
    match stem.strip_suffix(&suffix) {
        Some(trimmed) if !trimmed.is_empty() => format!("{trimmed}{ext}"),
        _ => file_name.replacen(&suffix, "", 1),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> ArtifactStore {
        ArtifactStore::open(dir.join("converted"), dir.join("names.json")).expect("open")
    }

    #[test]
    fn store_moves_file_and_records_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open(tmp.path());
        let produced = tmp.path().join("Song-abc.mp3");
        std::fs::write(&produced, b"audio").expect("write");

        let artifact = store.store("youtube-abc", &produced, "Song.mp3").expect("store");

        assert!(!produced.exists());
        assert_eq!(std::fs::read(&artifact.path).expect("read"), b"audio");
        assert_eq!(store.lookup("youtube-abc"), Some(artifact));
    }

    #[test]
    fn lookup_requires_file_and_record() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open(tmp.path());

        std::fs::write(store.path_for("orphan"), b"x").expect("write");
        assert_eq!(store.lookup("orphan"), None);

        let produced = tmp.path().join("out.mp3");
        std::fs::write(&produced, b"x").expect("write");
        let artifact = store.store("gone", &produced, "out.mp3").expect("store");
        std::fs::remove_file(&artifact.path).expect("remove");
        assert_eq!(store.lookup("gone"), None);
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open(tmp.path());
        let produced = tmp.path().join("out.mp3");
        std::fs::write(&produced, b"x").expect("write");
        store.store("key", &produced, "out.mp3").expect("store");

        assert!(store.remove("key").expect("remove"));
        assert!(!store.remove("key").expect("remove again"));
        assert_eq!(store.lookup("key"), None);
    }

    #[test]
    fn names_survive_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let produced = tmp.path().join("out.mp3");
        std::fs::write(&produced, b"x").expect("write");
        open(tmp.path()).store("key", &produced, "Nice.mp3").expect("store");

        let reopened = open(tmp.path());
        assert_eq!(reopened.lookup("key").map(|a| a.name), Some("Nice.mp3".to_string()));
    }

    #[test]
    fn strips_id_suffix_before_extension() {
        assert_eq!(strip_source_id("Song Title-dQw4w9WgXcQ.mp3", "dQw4w9WgXcQ"), "Song Title.mp3");
        assert_eq!(strip_source_id("Song Title.mp3", "dQw4w9WgXcQ"), "Song Title.mp3");
        assert_eq!(strip_source_id("a-ID-b.mp3", "ID"), "a-b.mp3");
        assert_eq!(strip_source_id("-ID.mp3", "ID"), ".mp3");
    }
}
