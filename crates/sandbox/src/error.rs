use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Forbidden,
    Launch,
    Internal,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("sandbox launch failed: {0}")]
    Launch(String),
    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Launch(_) => ErrorKind::Launch,
            Self::Workspace(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
