//! Durable file writes.
//!
//! Blocking helpers; async callers run them on the blocking pool.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Syncs a directory so that created, renamed or removed entries survive a crash.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

fn open_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Write `bytes` to `dir/file_name` atomically with owner-only permissions.
///
/// 1. Write to `dir/.file_name.tmp`
/// 2. fsync the temp file
/// 3. Rename over the target
/// 4. fsync the directory
pub fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let target = dir.join(file_name);
    let temp = dir.join(format!(".{file_name}.tmp"));

    let result = (|| {
        let mut file = open_private(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp, &target)?;
        fsync_dir(dir)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result.map(|()| target)
}

/// Remove a file and sync its directory.
pub fn remove_durable(path: &Path) -> io::Result<()> {
    std::fs::remove_file(path)?;
    if let Some(dir) = path.parent() {
        fsync_dir(dir)?;
    }
    Ok(())
}

/// Move a file into `dest_dir`, copying when a rename cannot cross filesystems.
pub fn move_into(path: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let target = dest_dir.join(file_name);

    if std::fs::rename(path, &target).is_err() {
        let bytes = std::fs::read(path)?;
        let name = file_name.to_string_lossy();
        write_atomic(dest_dir, &name, &bytes)?;
        std::fs::remove_file(path)?;
    }

    fsync_dir(dest_dir)?;
    if let Some(dir) = path.parent() {
        fsync_dir(dir)?;
    }
    Ok(target)
}
