pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("remote error: {message}")]
    Remote { message: String },

    #[error("server not found: {server_id}")]
    ServerNotFound { server_id: String },
}

impl Error {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}
