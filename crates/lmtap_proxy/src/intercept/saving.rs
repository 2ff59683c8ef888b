use std::sync::Arc;
use std::time::Duration;

use lmtap_domain::{ConversationStore, MessageId, Metadata, NewMessage, SimpleMessage};
use tracing::warn;

/// Shared persistence path for the protocol interceptors.
///
/// Turns a parsed `(history, assistant, status)` triple into store calls:
/// the longest already-recorded prefix of the history is reused, the
/// remaining tail is replayed, and the assistant reply is appended last.
/// Failures are logged and swallowed — persistence is best-effort and must
/// never affect the proxied response.
pub struct SavingSupport {
    name: String,
    store: Option<Arc<dyn ConversationStore>>,
    timeout: Duration,
}

impl SavingSupport {
    pub fn new(
        name: impl Into<String>,
        store: Option<Arc<dyn ConversationStore>>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persists one exchange under this support's own storage deadline,
    /// independent of the wire timeout.
    pub async fn save_exchange(
        &self,
        history: Vec<SimpleMessage>,
        assistant: SimpleMessage,
        status_code: u16,
        request_type: &str,
    ) {
        let Some(store) = &self.store else { return };

        let save = self.save_inner(store.as_ref(), history, assistant, status_code, request_type);
        if tokio::time::timeout(self.timeout, save).await.is_err() {
            warn!(interceptor = %self.name, "storage save timed out");
        }
    }

    async fn save_inner(
        &self,
        store: &dyn ConversationStore,
        history: Vec<SimpleMessage>,
        assistant: SimpleMessage,
        status_code: u16,
        request_type: &str,
    ) {
        // Walk backwards from the full history until a recorded prefix
        // matches.
        let mut parent_id: Option<MessageId> = None;
        let mut matched = history.len();
        while matched > 0 {
            match store
                .find_message_by_history(&history[..matched], request_type)
                .await
            {
                Err(err) => {
                    warn!(interceptor = %self.name, error = ?err, "could not find message by history");
                    return;
                }
                Ok(Some(found)) => {
                    // A prefix that is nothing but a shared system prompt
                    // must not coalesce unrelated conversations.
                    if matched == 1 && history[0].role == "system" {
                        matched = 0;
                    } else {
                        parent_id = Some(found);
                    }
                    break;
                }
                Ok(None) => matched -= 1,
            }
        }

        let mut branch_id = None;
        if parent_id.is_none() {
            let model = history
                .first()
                .and_then(|m| m.model.clone())
                .or_else(|| assistant.model.clone())
                .unwrap_or_default();
            let mut metadata = Metadata::new();
            metadata.insert("model".to_string(), model.into());

            match store.create_conversation(Some(metadata), request_type).await {
                Ok((_, branch)) => branch_id = Some(branch.id),
                Err(err) => {
                    warn!(interceptor = %self.name, error = ?err, "could not create conversation in storage");
                    return;
                }
            }
        }

        for (position, message) in history.into_iter().enumerate().skip(matched) {
            let mut new_message = NewMessage::from(message);
            new_message.branch_id = branch_id;
            match store.add_message(parent_id, new_message).await {
                Ok(saved) => {
                    parent_id = Some(saved.id);
                    // The branch is implied by the parent from here on.
                    branch_id = None;
                }
                Err(err) => {
                    warn!(
                        interceptor = %self.name,
                        error = ?err,
                        position,
                        "could not add history message to storage"
                    );
                    return;
                }
            }
        }

        if !assistant.content.is_empty() || !assistant.tool_calls.is_empty() || status_code != 0 {
            let mut new_message = NewMessage::from(assistant);
            new_message.branch_id = branch_id;
            new_message.upstream_status_code = (status_code != 0).then_some(status_code as i32);
            if let Err(err) = store.add_message(parent_id, new_message).await {
                warn!(interceptor = %self.name, error = ?err, "could not add assistant message to storage");
            }
        }
    }
}
