//! A key-value store backed by files in a local directory

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};

use super::{KeyValueStore, StoreError};

/// A key-value store that keeps each key in its own file
///
/// Keys are used verbatim as file names inside `dir`, so they may only contain
/// ASCII alphanumerics, `-`, `_` and `.`.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Constructs a new file store rooted at `dir`
    ///
    /// The directory is created on first write if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the stored values
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));

        if valid {
            Ok(self.dir.join(key))
        } else {
            Err(StoreError::InvalidKey(key.to_owned()))
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir).await?;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&path).await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    #[tokio::test]
    async fn values_survive_a_new_store_instance() -> Result<()> {
        let dir = tempfile::tempdir()?;

        FileStore::new(dir.path()).set("auth-tokens", "{}").await?;
        let value = FileStore::new(dir.path()).get("auth-tokens").await?;

        assert_eq!(value.as_deref(), Some("{}"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_values_read_as_none() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path().join("not-yet-created"));
        assert!(!store.dir().exists());

        assert_eq!(store.get("auth-tokens").await?, None);
        store.remove("auth-tokens").await?;
        Ok(())
    }

    #[tokio::test]
    async fn remove_deletes_the_value() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path());

        store.set("auth-tokens", "first").await?;
        store.set("auth-tokens", "second").await?;
        assert_eq!(store.get("auth-tokens").await?.as_deref(), Some("second"));

        store.remove("auth-tokens").await?;
        assert_eq!(store.get("auth-tokens").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn path_traversal_keys_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path());

        let err = store.set("../escape", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_private() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path());
        store.set("auth-tokens", "{}").await?;

        let mode = std::fs::metadata(dir.path().join("auth-tokens"))?
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }
}
