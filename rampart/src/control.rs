use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Exclusive control-plane lease. Created with `create_new` so a second
/// controller fails fast instead of interleaving mutations; dropped (and
/// the lock file removed) when the command finishes.
#[derive(Debug)]
pub struct ControlLease {
    path: PathBuf,
}

impl ControlLease {
    pub fn acquire(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("create state dir {}: {e}", parent.display()))?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(ControlLease {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(format!(
                "control channel busy: lease {} held by another controller",
                path.display()
            )),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(format!(
                "control channel permission denied: {}",
                path.display()
            )),
            Err(e) => Err(format!("acquire control lease {}: {e}", path.display())),
        }
    }
}

impl Drop for ControlLease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
