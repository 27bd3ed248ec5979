// Per-task working directory
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::{chown, Gid, Uid};
use tracing::{debug, warn};

/// Work directory guard - removes the directory on drop
///
/// Covers every exit path of a task: success, failure, cancellation and
/// panic unwinding.
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Create `<temp_dir>/judge_<submission>_<nanos>`, mode 0777, owned by
    /// the jail user so compilers can write their outputs.
    pub fn create(temp_dir: &Path, submission_id: i64, uid: u32, gid: u32) -> io::Result<Self> {
        fs::create_dir_all(temp_dir)?;

        let mut nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = loop {
            let candidate = temp_dir.join(format!("judge_{}_{}", submission_id, nanos));
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => nanos += 1,
                Err(e) => return Err(e),
            }
        };
        let guard = WorkDir { path };

        fs::set_permissions(&guard.path, fs::Permissions::from_mode(0o777))?;
        if let Err(e) = chown(&guard.path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
            // running unprivileged (tests, development): 0777 still lets the jail write
            debug!(path = %guard.path.display(), error = %e, "chown of work dir failed");
        }

        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.path.join(name)
    }

    /// Write a file readable by the jail user (0644)
    pub fn write_file(&self, name: &str, contents: &str) -> io::Result<PathBuf> {
        let path = self.path.join(name);
        fs::write(&path, contents)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        Ok(path)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove work dir");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_dir_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let path = {
            let dir = WorkDir::create(temp.path(), 42, uid, gid).unwrap();
            let name = dir.path().file_name().unwrap().to_string_lossy().to_string();
            assert!(name.starts_with("judge_42_"));

            let mode = fs::metadata(dir.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o777);

            let input = dir.write_file("input_1.txt", "1 2").unwrap();
            assert_eq!(fs::read_to_string(&input).unwrap(), "1 2");
            dir.path().to_path_buf()
        };

        assert!(!path.exists());
    }

    #[test]
    fn test_removed_on_panic() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();

        let result = std::panic::catch_unwind(|| {
            let _dir = WorkDir::create(&root, 7, 0, 0).unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_distinct_names() {
        let temp = tempfile::tempdir().unwrap();
        let a = WorkDir::create(temp.path(), 1, 0, 0).unwrap();
        let b = WorkDir::create(temp.path(), 1, 0, 0).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
