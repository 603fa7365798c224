use thiserror::Error;

#[derive(Error, Debug)]
pub enum CosyncError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("document error: {0}")]
    Document(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("sync timed out for document {0}")]
    SyncTimeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
