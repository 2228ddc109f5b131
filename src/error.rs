use std::io;
use std::path::{Path, PathBuf};

/// Operator typed `q` (or closed stdin) at a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operator requested quit")]
pub struct Cancelled;

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("Unable to locate {what} under {roots}")]
    NotFound { what: String, roots: String },
    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("Quit requested by operator")]
    QuitRequested,
    #[error("{tool} failed: {reason}")]
    ExternalTool { tool: String, reason: String },
    #[error("Template {name} could not be rendered: {reason}")]
    Template { name: String, reason: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl InjectError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        InjectError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn parse(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        InjectError::Parse {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        InjectError::ExternalTool {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Fatal errors end the whole run; the rest only end the current control file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InjectError::NotFound { .. }
                | InjectError::Parse { .. }
                | InjectError::QuitRequested
                | InjectError::Config(_)
        )
    }
}

impl From<Cancelled> for InjectError {
    fn from(_: Cancelled) -> Self {
        InjectError::QuitRequested
    }
}
