use crate::error::{EngineError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub static CONTAINERS: &str = "containers";
pub static IMAGE_UPDATES: &str = "imageUpdates";
pub static IMAGES: &str = "images";

/// Whole-collection JSON snapshots, one file per name under a data directory.
///
/// Writes go to a temporary file in the same directory which is then renamed over the
/// previous snapshot, so readers see either the old or the new collection, never a
/// truncated one.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// A snapshot that was never written reads as an empty collection.
    pub fn read_all<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.path(name);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::io(path, e)),
        };
        serde_json::from_slice(&content).map_err(|e| EngineError::Snapshot {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    pub fn write_all<T: Serialize>(&self, name: &str, records: &[T]) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| EngineError::io(&self.dir, e))?;
        let path = self.path(name);

        let tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| EngineError::io(&self.dir, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, records).map_err(|e| {
                EngineError::Snapshot {
                    name: name.to_string(),
                    message: e.to_string(),
                }
            })?;
            writer.flush().map_err(|e| EngineError::io(tmp.path(), e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| EngineError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| EngineError::io(&path, e.error))?;

        debug!("Wrote {} records to snapshot {}", records.len(), path.display());
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
