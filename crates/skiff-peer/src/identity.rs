use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use skiff_proto::SessionId;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read identity file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write identity file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Reuses the id stored at `path`, or generates one and stores it there.
pub fn load_or_create_identity(path: &Path) -> Result<SessionId, IdentityError> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let id = SessionId::new(contents.trim());
            if !id.is_blank() {
                debug!(target = "skiff::identity", path = %path.display(), %id, "reusing session id");
                return Ok(id);
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(IdentityError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let id = SessionId::generate();
    let write_err = |source| IdentityError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, format!("{id}\n")).map_err(write_err)?;
    info!(target = "skiff::identity", path = %path.display(), %id, "generated new session id");
    Ok(id)
}

/// `explicit` wins; otherwise the persisted id, or a fresh one when no file is configured.
pub fn resolve_identity(
    explicit: Option<SessionId>,
    id_file: Option<&Path>,
) -> Result<SessionId, IdentityError> {
    match (explicit, id_file) {
        (Some(id), _) if !id.is_blank() => Ok(id),
        (_, Some(path)) => load_or_create_identity(path),
        _ => Ok(SessionId::generate()),
    }
}
