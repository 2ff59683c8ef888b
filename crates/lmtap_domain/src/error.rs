use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid conversation id: {0}")]
    InvalidConversationId(uuid::Error),

    #[error("invalid branch id: {0}")]
    InvalidBranchId(uuid::Error),

    #[error("invalid message id: {0}")]
    InvalidMessageId(uuid::Error),

    #[error("a branch id is required when no parent message is given")]
    MissingBranch,
}

pub type Result<T> = std::result::Result<T, Error>;
