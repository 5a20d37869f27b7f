//! File system utils.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

pub struct FsHandler;

impl FsHandler {
    /// Directory holding `path`, `.` for a bare file name.
    pub fn parent_directory(path: &Path) -> PathBuf {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Create the directory holding `path` if it doesn't exist.
    pub fn create_parent_directory(path: &Path) -> io::Result<()> {
        let parent = Self::parent_directory(path);
        std::fs::create_dir_all(&parent)?;
        tracing::trace!("Ensured directory exists: {}", parent.display());
        Ok(())
    }

    /// `path` with `suffix` appended to its file name.
    pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Replace `path` with `contents` through a temporary file in the same directory.
    ///
    /// Readers see either the previous file or the new one, never a partial write.
    pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = NamedTempFile::new_in(Self::parent_directory(path))?;
        file.write_all(contents)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|err| err.error)?;

        tracing::debug!("Wrote {} bytes to {}", contents.len(), path.display());
        Ok(())
    }

    /// Copy `source` to `destination` without overwriting an existing file.
    ///
    /// A destination created by a copy that fails midway is removed.
    pub fn copy_new(source: &Path, destination: &Path) -> io::Result<()> {
        let mut reader = std::fs::File::open(source)?;
        let mut writer = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(destination)?;

        let copied = io::copy(&mut reader, &mut writer).and_then(|_| writer.sync_all());
        if copied.is_err() {
            drop(writer);
            if let Err(err) = std::fs::remove_file(destination) {
                tracing::warn!("Failed to remove partial copy {}: {}", destination.display(), err);
            }
        }
        copied
    }
}
