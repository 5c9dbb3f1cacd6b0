use crate::media::sanitize_filename;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use uuid::Uuid;

/// An upload persisted for the lifetime of one request. The file is removed
/// when the guard drops.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    /// Write `data` to `<dir>/<uuid>_<sanitized filename>`
    pub async fn write(dir: &Path, filename: &str, data: &[u8]) -> std::io::Result<Self> {
        let name = format!("{}_{}", Uuid::new_v4(), sanitize_filename(filename));
        // guard first so a partial write is cleaned up too
        let staged = Self {
            path: dir.join(name),
        };
        tokio::fs::write(&staged.path, data).await?;
        debug!(path = ?staged.path, bytes = data.len(), "Upload staged");
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Staged upload removed"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => error!(path = ?self.path, %error, "Error cleaning up staged upload"),
        }
    }
}

pub async fn init_staging_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

/// Remove the staging directory and anything left in it
pub async fn remove_staging_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => info!(?dir, "Staging directory removed"),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => error!(?dir, %error, "Cleanup error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vila-staging-{}", Uuid::new_v4()));
        init_staging_dir(&dir).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn test_staged_file_is_removed_on_drop() {
        let dir = scratch_dir().await;
        let staged = StagedFile::write(&dir, "cat.png", b"png bytes").await.unwrap();
        let path = staged.path().to_path_buf();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"png bytes");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_cat.png"), "{name}");

        drop(staged);
        assert!(!path.exists());
        remove_staging_dir(&dir).await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_same_filename_never_collides() {
        let dir = scratch_dir().await;
        let a = StagedFile::write(&dir, "clip.mp4", b"a").await.unwrap();
        let b = StagedFile::write(&dir, "clip.mp4", b"b").await.unwrap();

        assert_ne!(a.path(), b.path());
        assert_eq!(tokio::fs::read(a.path()).await.unwrap(), b"a");
        assert_eq!(tokio::fs::read(b.path()).await.unwrap(), b"b");
        remove_staging_dir(&dir).await;
    }

    #[tokio::test]
    async fn test_traversal_stays_in_staging_dir() {
        let dir = scratch_dir().await;
        let staged = StagedFile::write(&dir, "../../escape.gif", b"gif")
            .await
            .unwrap();
        assert_eq!(staged.path().parent(), Some(dir.as_path()));
        drop(staged);
        remove_staging_dir(&dir).await;
    }

    #[tokio::test]
    async fn test_missing_file_on_drop_is_ignored() {
        let dir = scratch_dir().await;
        let staged = StagedFile::write(&dir, "x.png", b"x").await.unwrap();
        std::fs::remove_file(staged.path()).unwrap();
        drop(staged);
        remove_staging_dir(&dir).await;
    }
}
