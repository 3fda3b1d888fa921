//! Atomic create-with-unique-suffix temp file helper (spec §6).
//!
//! Files are named `<dir>/<prefix>.XXXXXX`; the 6-character suffix is
//! regenerated on a collision rather than relying on a PID or counter, so
//! concurrent operators never need to coordinate.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{FlowError, Result};

const SUFFIX_LEN: usize = 6;
const MAX_ATTEMPTS: usize = 64;

pub struct TempFile {
    path: PathBuf,
    file: Option<File>,
}

impl TempFile {
    pub fn create(dir: &Path, prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        for _ in 0..MAX_ATTEMPTS {
            let path = dir.join(format!("{prefix}.{}", random_suffix()));
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    return Ok(Self {
                        path,
                        file: Some(file),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(FlowError::Io(e)),
            }
        }
        Err(FlowError::AllocationFailure(format!(
            "could not create a unique temp file under {}",
            dir.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("temp file handle already closed")
    }

    pub fn reopen_read(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }
}

fn random_suffix() -> String {
    (0..SUFFIX_LEN)
        .map(|_| {
            let n = fastrand::u8(0..36);
            if n < 10 {
                (b'0' + n) as char
            } else {
                (b'a' + n - 10) as char
            }
        })
        .collect()
}

impl Drop for TempFile {
    fn drop(&mut self) {
        self.file.take();
        let _ = std::fs::remove_file(&self.path);
    }
}
