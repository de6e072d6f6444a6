use anyhow::{Result, bail};
use nix::unistd::getuid;
use std::fs::{self, DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Resolve the directory holding config artifacts and worker logs.
pub fn determine(state_dir: Option<PathBuf>) -> Result<PathBuf> {
    let uid = getuid().as_raw();

    if let Some(path) = state_dir {
        create_private_dir(&path)?;
        let path = path.canonicalize()?;
        return Ok(path);
    }

    // see https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
    if let Ok(path) = std::env::var("XDG_RUNTIME_DIR") {
        let path = Path::new(&path).join("bridged");
        if create_private_dir(&path).is_ok() {
            return Ok(path);
        }
    }

    if let Ok(path) = std::env::var("HOME")
        && let Ok(resolved) = fs::canonicalize(path)
    {
        let run_dir = resolved.join(".bridged/run");
        if create_private_dir(&run_dir).is_ok() {
            return Ok(run_dir);
        }
    }

    let tmp_dir = PathBuf::from(format!("/tmp/bridged-{uid}"));
    if create_private_dir(&tmp_dir).is_ok() {
        return Ok(tmp_dir);
    }

    bail!("could not find a state location with suitable permissions for the current user");
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(path)?;
    fs::set_permissions(path, Permissions::from_mode(0o700))
}
