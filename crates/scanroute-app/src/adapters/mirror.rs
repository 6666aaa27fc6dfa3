//! Remote storage mirrored into a local directory, such as a synced cloud folder.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scanroute_core::{PipelineError, PipelineResult, RemoteMetadata, RemoteStorage};
use scanroute_pipeline::sha256_hex;
use tempfile::NamedTempFile;
use tracing::debug;

/// Writes remote paths (`/Store/orders/...`) below a local mirror root.
#[derive(Debug, Clone)]
pub struct LocalMirrorStorage {
    root: PathBuf,
}

impl LocalMirrorStorage {
    /// Mirror rooted at `root`; created lazily on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Local path backing a remote path.
    #[must_use]
    pub fn local_path(&self, remote: &str) -> PathBuf {
        remote
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

fn mirror_error(operation: &'static str, path: &Path, err: &io::Error) -> PipelineError {
    PipelineError::transient(operation, format!("{}: {err}", path.display()))
}

fn copy_atomically(source: &Path, destination: &Path) -> io::Result<()> {
    let parent = destination
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(parent)?;
    let mut staged = NamedTempFile::new_in(parent)?;
    let mut reader = File::open(source)?;
    io::copy(&mut reader, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(destination).map_err(|err| err.error)?;
    Ok(())
}

#[async_trait]
impl RemoteStorage for LocalMirrorStorage {
    async fn put_file(&self, destination: &str, local_file: &Path) -> PipelineResult<()> {
        if let Err(source) = tokio::fs::metadata(local_file).await {
            return Err(PipelineError::FilesystemRace {
                operation: "mirror.put_file",
                path: local_file.to_path_buf(),
                source,
            });
        }
        let target = self.local_path(destination);
        let source = local_file.to_path_buf();
        let copied = tokio::task::spawn_blocking({
            let target = target.clone();
            move || copy_atomically(&source, &target)
        })
        .await
        .map_err(|err| PipelineError::transient("mirror.put_file", err.to_string()))?;
        copied.map_err(|err| mirror_error("mirror.put_file", &target, &err))?;
        debug!(destination, mirror_path = %target.display(), "file mirrored");
        Ok(())
    }

    async fn exists(&self, destination: &str) -> PipelineResult<Option<RemoteMetadata>> {
        let target = self.local_path(destination);
        let metadata = match tokio::fs::metadata(&target).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(mirror_error("mirror.exists", &target, &err)),
        };
        let content_hash = sha256_hex(target).await?;
        Ok(Some(RemoteMetadata {
            size: metadata.len(),
            content_hash: Some(content_hash),
        }))
    }

    async fn create_shared_link(&self, folder: &str) -> PipelineResult<String> {
        let target = self.local_path(folder);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|err| mirror_error("mirror.create_shared_link", &target, &err))?;
        let absolute = tokio::fs::canonicalize(&target)
            .await
            .map_err(|err| mirror_error("mirror.create_shared_link", &target, &err))?;
        Ok(format!("file://{}", absolute.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use tempfile::TempDir;

    #[test]
    fn local_path_drops_traversal_segments() {
        let mirror = LocalMirrorStorage::new("/mirror");
        assert_eq!(
            mirror.local_path("/Store/orders/../x/./a.jpg"),
            PathBuf::from("/mirror/Store/orders/x/a.jpg")
        );
    }

    #[tokio::test]
    async fn put_then_exists_reports_size_and_hash() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let source = temp.path().join("frame.jpg");
        fs::write(&source, b"frame-bytes")?;
        let mirror = LocalMirrorStorage::new(temp.path().join("mirror"));

        assert!(mirror.exists("/Store/orders/a/frame.jpg").await?.is_none());
        mirror.put_file("/Store/orders/a/frame.jpg", &source).await?;
        let meta = mirror
            .exists("/Store/orders/a/frame.jpg")
            .await?
            .ok_or("mirrored file missing")?;
        assert_eq!(meta.size, 11);
        assert_eq!(meta.content_hash, Some(sha256_hex(source.clone()).await?));
        assert!(source.exists(), "source files are never removed");
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_a_filesystem_race() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let mirror = LocalMirrorStorage::new(temp.path());
        let err = mirror
            .put_file("/x/a.jpg", &temp.path().join("gone.jpg"))
            .await
            .err()
            .ok_or("expected failure")?;
        assert!(matches!(err, PipelineError::FilesystemRace { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn shared_links_are_file_urls() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let mirror = LocalMirrorStorage::new(temp.path());
        let url = mirror.create_shared_link("/Store/orders/jeff@example.com").await?;
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("jeff@example.com"));
        assert!(temp.path().join("Store/orders/jeff@example.com").is_dir());
        Ok(())
    }
}
