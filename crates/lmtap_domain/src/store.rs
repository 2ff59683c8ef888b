use async_trait::async_trait;

use crate::{
    Branch, BranchId, Conversation, ConversationId, ConversationOverview, Message, MessageId,
    Metadata, NewMessage, SimpleMessage,
};

/// Window into a paginated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Clamps the limit into `(0, 1000]` (non-positive becomes the default
    /// of 100) and floors the offset at zero.
    pub fn normalize(self) -> Self {
        let limit = if self.limit <= 0 {
            Self::DEFAULT_LIMIT
        } else {
            self.limit.min(Self::MAX_LIMIT)
        };
        Self {
            limit,
            offset: self.offset.max(0),
        }
    }
}

/// Contract for persisting and querying the branched conversation ledger.
///
/// Appends are transactional: a parent message that already has a child
/// forks a new branch atomically, so concurrent appends from the same
/// parent serialise at the parent row. Callers impose their own deadlines
/// (the saving path wraps every call in its storage timeout).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates a conversation together with its empty root branch.
    async fn create_conversation(
        &self,
        metadata: Option<Metadata>,
        request_type: &str,
    ) -> anyhow::Result<(Conversation, Branch)>;

    async fn get_conversation(&self, id: ConversationId)
        -> anyhow::Result<Option<Conversation>>;

    /// Appends a message under `parent_message_id`, forking a new branch
    /// when the parent already has a child. Without a parent the message
    /// becomes sequence 1 of `message.branch_id`.
    async fn add_message(
        &self,
        parent_message_id: Option<MessageId>,
        message: NewMessage,
    ) -> anyhow::Result<Message>;

    /// Full replayable history of a branch, spliced across its ancestor
    /// branches, in ascending sequence order.
    async fn get_branch_history(&self, branch_id: BranchId) -> anyhow::Result<Vec<Message>>;

    /// Finds the most recently created message whose cumulative hash equals
    /// the hash of `history`, restricted to conversations of `request_type`.
    /// An empty history never matches.
    async fn find_message_by_history(
        &self,
        history: &[SimpleMessage],
        request_type: &str,
    ) -> anyhow::Result<Option<MessageId>>;

    async fn list_conversations(
        &self,
        page: Pagination,
    ) -> anyhow::Result<Vec<ConversationOverview>>;

    /// Substring search over message content, newest first.
    async fn search_messages(
        &self,
        query: &str,
        page: Pagination,
    ) -> anyhow::Result<Vec<Message>>;

    async fn get_conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Vec<Message>>;

    async fn get_branch(&self, branch_id: BranchId) -> anyhow::Result<Option<Branch>>;
}
