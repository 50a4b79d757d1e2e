//! Local file target, standing in for an embedded device store.
//!
//! The file starts with the write time (milliseconds since the epoch, little
//! endian `i64`) followed by the stored bytes, so `timestamp()` only has to
//! read the header.

use crate::error::TargetError;
use crate::target::{next_write_time, Target, Timestamp, Timestamped};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

/// Target type key.
pub const FILE_KIND: &str = "file";

const HEADER_LEN: usize = 8;

/// Target storing its content in a single local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    path: PathBuf,
}

impl FileTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling the next write is staged in; unique per target path.
    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".partial");
        PathBuf::from(name)
    }

    async fn read_header(&self) -> Result<Option<Timestamp>, TargetError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)
            .await
            .map_err(|_| TargetError::other(format!("truncated file {}", self.path.display())))?;
        decode_time(header).map(Some)
    }
}

fn decode_time(header: [u8; HEADER_LEN]) -> Result<Timestamp, TargetError> {
    Utc.timestamp_millis_opt(i64::from_le_bytes(header))
        .single()
        .ok_or_else(|| TargetError::other("invalid file header"))
}

#[async_trait]
impl Target for FileTarget {
    fn kind(&self) -> &'static str {
        FILE_KIND
    }

    async fn read(&self) -> Result<Option<Timestamped<Vec<u8>>>, TargetError> {
        let mut bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < HEADER_LEN {
            return Err(TargetError::other(format!(
                "truncated file {}",
                self.path.display()
            )));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let timestamp = decode_time(header)?;
        let value = bytes.split_off(HEADER_LEN);
        Ok(Some(Timestamped::new(timestamp, value)))
    }

    async fn write(&self, buffer: Vec<u8>) -> Result<Timestamp, TargetError> {
        let previous = self.read_header().await.unwrap_or(None);
        // The header only holds milliseconds, so step past the previous write
        // at that precision.
        let mut millis = next_write_time(previous).timestamp_millis();
        if let Some(previous) = previous {
            millis = millis.max(previous.timestamp_millis() + 1);
        }
        let header = millis.to_le_bytes();

        let mut contents = Vec::with_capacity(HEADER_LEN + buffer.len());
        contents.extend_from_slice(&header);
        contents.extend_from_slice(&buffer);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Write to a sibling file first so readers never observe a torn file.
        let staging = self.staging_path();
        tokio::fs::write(&staging, contents).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        decode_time(header)
    }

    async fn timestamp(&self) -> Result<Option<Timestamp>, TargetError> {
        self.read_header().await
    }

    fn serialise(&self) -> serde_json::Value {
        serde_json::json!({ "path": self.path.to_string_lossy() })
    }

    fn is_local(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("jasper-file-target-{}", ulid::Ulid::new()))
            .join(name)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let target = FileTarget::new(scratch_path("missing.bin"));
        assert_eq!(target.read().await.unwrap(), None);
        assert_eq!(target.timestamp().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_read_timestamp() {
        let path = scratch_path("value.bin");
        let target = FileTarget::new(&path);

        let first = target.write(b"one".to_vec()).await.unwrap();
        let second = target.write(b"two".to_vec()).await.unwrap();
        assert!(second > first);

        let read = target.read().await.unwrap().unwrap();
        assert_eq!(read.value, b"two".to_vec());
        assert_eq!(read.timestamp, second);
        assert_eq!(target.timestamp().await.unwrap(), Some(second));

        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }

    #[test]
    fn test_staging_keeps_full_file_name() {
        let bin = FileTarget::new("/tmp/value.bin");
        let txt = FileTarget::new("/tmp/value.txt");
        assert_eq!(bin.staging_path(), PathBuf::from("/tmp/value.bin.partial"));
        assert_ne!(bin.staging_path(), txt.staging_path());
    }

    #[tokio::test]
    async fn test_targets_sharing_a_stem_stay_apart() {
        let path = scratch_path("value.bin");
        let bin = FileTarget::new(&path);
        let txt = FileTarget::new(path.with_extension("txt"));

        let (a, b) = tokio::join!(bin.write(b"bin".to_vec()), txt.write(b"txt".to_vec()));
        a.unwrap();
        b.unwrap();

        assert_eq!(bin.read().await.unwrap().unwrap().value, b"bin".to_vec());
        assert_eq!(txt.read().await.unwrap().unwrap().value, b"txt".to_vec());
        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }

    #[test]
    fn test_equality_by_path() {
        let a = FileTarget::new("/tmp/a.bin");
        assert!(a.equals(&FileTarget::new("/tmp/a.bin")));
        assert!(!a.equals(&FileTarget::new("/tmp/b.bin")));
    }
}
