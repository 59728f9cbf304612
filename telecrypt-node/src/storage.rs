//! Decrypted messages as numbered files: `<dir>/<prefix>_<n>.txt`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use telecrypt_core::{Storage, StorageError};

#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    prefix: String,
    next: u64,
}

impl FileStorage {
    /// Create `dir` if needed. Numbering resumes after the highest index already
    /// present, so a restarted node never overwrites earlier messages.
    pub fn open(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, StorageError> {
        let dir = dir.into();
        let prefix = prefix.into();
        fs::create_dir_all(&dir)?;
        let next = next_free_index(&dir, &prefix)?;
        tracing::info!(dir = %dir.display(), next, "file storage ready");
        Ok(Self { dir, prefix, next })
    }

    pub fn path_for(&self, n: u64) -> PathBuf {
        self.dir.join(format!("{}_{}.txt", self.prefix, n))
    }
}

fn next_free_index(dir: &Path, prefix: &str) -> Result<u64, StorageError> {
    let mut next = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let index = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|rest| rest.strip_suffix(".txt"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(n) = index {
            next = next.max(n + 1);
        }
    }
    Ok(next)
}

impl Storage for FileStorage {
    fn persist(&mut self, plaintext: &[u8]) -> Result<u64, StorageError> {
        let n = self.next;
        let path = self.path_for(n);
        let mut file = fs::File::create(&path)?;
        file.write_all(plaintext)?;
        file.sync_all()?;
        self.next += 1;
        tracing::debug!(path = %path.display(), len = plaintext.len(), "message written");
        Ok(n)
    }
}
