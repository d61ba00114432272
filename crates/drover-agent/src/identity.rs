//! Persistent agent identity.
//!
//! The uuid is generated on first start and written to `guid.txt` in the
//! identity directory. Later starts reuse it, so the server keeps seeing the
//! same agent across restarts.

use drover_core::AgentId;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const IDENTITY_FILE: &str = "guid.txt";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Failed to access identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Identity file {path} does not hold a uuid: {value:?}")]
    Malformed { path: PathBuf, value: String },
}

impl From<IdentityError> for drover_core::Error {
    fn from(err: IdentityError) -> Self {
        drover_core::Error::Internal(err.to_string())
    }
}

pub fn identity_file(dir: &Path) -> PathBuf {
    dir.join(IDENTITY_FILE)
}

/// Load the agent id stored in `dir`, creating one if none exists.
pub fn load_or_create(dir: &Path) -> Result<AgentId, IdentityError> {
    let path = identity_file(dir);
    let io_err = |source| IdentityError::Io {
        path: path.clone(),
        source,
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let value = contents.trim();
            let uuid = Uuid::parse_str(value).map_err(|_| IdentityError::Malformed {
                path: path.clone(),
                value: value.to_string(),
            })?;
            Ok(AgentId::from_uuid(uuid))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(dir).map_err(io_err)?;
            let id = AgentId::new();
            std::fs::write(&path, id.as_uuid().to_string()).map_err(io_err)?;
            info!(agent_id = %id, path = %path.display(), "Generated agent identity");
            Ok(id)
        }
        Err(e) => Err(io_err(e)),
    }
}
