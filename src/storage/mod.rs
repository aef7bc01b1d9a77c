use crate::error::{Result, SwarmError};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Flat directory of shared files, addressed by bare file name
#[derive(Debug, Clone)]
pub struct Repository {
    dir: PathBuf,
}

impl Repository {
    /// Open (and create if needed) the repository directory
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        info!("Repository at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `name` inside the repository. Names with directories are refused.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.dir.join(name)),
            _ => Err(SwarmError::NotFound(format!("Invalid file name {:?}", name))),
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        match self.path(name) {
            Ok(path) => fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path(name)?;
        match fs::read(&path).await {
            Ok(data) => {
                debug!("Read {} bytes from {}", data.len(), path.display());
                Ok(data)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(SwarmError::NotFound(format!("File not found: {}", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create or truncate `name` and write `data` to it
    pub async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut file = self.create(name).await?;
        file.write_all(data).await?;
        file.flush().await?;

        info!("Wrote {} ({} bytes)", name, data.len());
        Ok(())
    }

    pub async fn open_read(&self, name: &str) -> Result<File> {
        let path = self.path(name)?;
        File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => SwarmError::NotFound(format!("File not found: {}", name)),
            _ => e.into(),
        })
    }

    pub async fn create(&self, name: &str) -> Result<File> {
        let path = self.path(name)?;
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?)
    }

    /// Names of regular files, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}
