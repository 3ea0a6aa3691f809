// Output files are written beside their destination and renamed into place
// only once fully flushed, so a failed run never leaves a truncated table.
// Outputs that belong together are published with `commit_all`, so a failed
// run does not leave some of them behind either.

use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use log::warn;

use crate::error::Result;

pub struct AtomicFile {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl AtomicFile {
    pub fn create(dest: &Path) -> Result<AtomicFile> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let temp = tempfile::Builder::new()
            .prefix(".cellmap-")
            .suffix(".partial")
            .tempfile_in(dir)?;

        Ok(AtomicFile {
            temp,
            dest: dest.to_path_buf(),
        })
    }

    pub fn as_file(&self) -> &File {
        self.temp.as_file()
    }

    pub fn destination(&self) -> &Path {
        &self.dest
    }

    pub fn commit(self) -> Result<()> {
        self.temp.as_file().sync_all()?;
        self.temp.persist(&self.dest).map_err(|e| e.error)?;
        Ok(())
    }
}

// Publish every file or none. Everything is flushed before the first rename,
// and files already renamed are removed again if a later rename fails.
pub fn commit_all(files: Vec<AtomicFile>) -> Result<()> {
    for file in &files {
        file.as_file().sync_all()?;
    }

    let mut published: Vec<PathBuf> = Vec::with_capacity(files.len());
    for file in files {
        let dest = file.dest;
        if let Err(err) = file.temp.persist(&dest) {
            for path in &published {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Unable to remove {}: {}", path.display(), e);
                }
            }
            return Err(err.error.into());
        }
        published.push(dest);
    }
    Ok(())
}
