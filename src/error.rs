//! Error taxonomy shared by the registry, the supervisor and the dashboard.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by registry lookups and supervisor actions.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The project file could not be read or failed validation.
    #[error("config error: {0}")]
    Config(String),
    /// No project with this name is registered.
    #[error("project '{0}' not found")]
    NotFound(String),
    /// The OS refused to launch the project's command.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    /// A stop was requested for a project without a live process.
    #[error("project '{0}' is not running")]
    NotRunning(String),
    /// Another supervisor instance holds the state directory lock.
    #[error("another pmctl instance is managing {}", .0.display())]
    InstanceLocked(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SupervisorError {
    /// HTTP status code the dashboard reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            _ => 500,
        }
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_http_status() {
        assert_eq!(SupervisorError::NotFound("api".into()).http_status(), 404);
        assert_eq!(SupervisorError::NotRunning("api".into()).http_status(), 500);
        let spawn = SupervisorError::Spawn {
            name: "api".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(spawn.http_status(), 500);
        assert_eq!(
            SupervisorError::Config("bad".into()).to_string(),
            "config error: bad"
        );
    }
}
