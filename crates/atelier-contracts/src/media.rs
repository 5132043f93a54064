use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

/// Blob storage boundary. Locations are opaque strings: locally-rooted
/// locations resolve against the store, externally-rooted `http(s)://`
/// locations are fetched by the engine's shared client.
pub trait MediaStore {
    fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<String>;
    fn fetch(&self, location: &str) -> Result<Vec<u8>>;
}

/// Directory-rooted media store. Saved blobs land under
/// `<root>/generated/<uuid>-<name>` and the returned location is the
/// absolute path.
#[derive(Debug, Clone)]
pub struct DirMediaStore {
    root: PathBuf,
}

impl DirMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("generated"))
            .with_context(|| format!("failed to create media root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MediaStore for DirMediaStore {
    fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<String> {
        let name = sanitize_name(suggested_name);
        let path = self
            .root
            .join("generated")
            .join(format!("{}-{}", Uuid::new_v4(), name));
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path.to_string_lossy().to_string())
    }

    fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        if location.starts_with("http://") || location.starts_with("https://") {
            anyhow::bail!("externally-rooted location requires a network fetch: {location}");
        }
        let path = Path::new(location);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        std::fs::read(&resolved).with_context(|| format!("failed to read {}", resolved.display()))
    }
}

fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact.bin".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_fetch_round_trip() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DirMediaStore::new(temp.path())?;

        let location = store.save(b"png-bytes", "loop.gif")?;
        assert!(location.ends_with(".gif"));
        assert_eq!(store.fetch(&location)?, b"png-bytes".to_vec());
        Ok(())
    }

    #[test]
    fn fetch_rejects_external_locations() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DirMediaStore::new(temp.path())?;
        assert!(store.fetch("https://cdn.example.com/a.png").is_err());
        Ok(())
    }

    #[test]
    fn suggested_names_are_sanitized() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DirMediaStore::new(temp.path())?;
        let location = store.save(b"x", "weird name!!/..png")?;
        assert!(!location.contains(' '));
        assert!(!location.contains('!'));
        assert!(store.fetch(&location).is_ok());
        Ok(())
    }
}
