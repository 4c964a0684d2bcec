use std::path::{Path, PathBuf};

use anyhow::Context as _;

/// Directory-backed store for packaged decks, addressed by file name.
/// The download route resolves names through `open`, so names are
/// validated against path traversal here and nowhere else.
#[derive(Debug, Clone)]
pub struct DeckStore {
    dir: PathBuf,
}

impl DeckStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.path_for(file_name)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create deck dir: {}", self.dir.display()))?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("write deck: {}", path.display()))?;
        tracing::info!(path = %path.display(), size = bytes.len(), "deck saved");
        Ok(path)
    }

    pub async fn open(&self, file_name: &str) -> anyhow::Result<tokio::fs::File> {
        let path = self.path_for(file_name)?;
        tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("open deck: {}", path.display()))
    }

    fn path_for(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        if file_name.is_empty()
            || file_name.contains(['/', '\\'])
            || file_name.contains("..")
        {
            anyhow::bail!("invalid deck file name: {file_name}");
        }
        Ok(self.dir.join(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeckStore::new(dir.path());
        store.save("biology_1.apkg", b"bytes").await.unwrap();
        assert!(store.open("biology_1.apkg").await.is_ok());
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeckStore::new(dir.path());
        assert!(store.open("../etc/passwd").await.is_err());
        assert!(store.save("a/b.apkg", b"x").await.is_err());
        assert!(store.save("", b"x").await.is_err());
    }
}
