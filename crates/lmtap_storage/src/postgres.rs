use std::collections::HashMap;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::Uuid as SqlUuid;
use lmtap_domain::{
    chain_hash, history_hash, Branch, BranchId, Conversation, ConversationId,
    ConversationOverview, ConversationStore, Message, MessageId, Metadata, NewMessage,
    Pagination, SimpleMessage,
};
use uuid::Uuid;

use crate::database::schema::{branches, conversations, messages};
use crate::database::{DatabasePool, PoolConfig};

/// PostgreSQL-backed conversation ledger.
pub struct PostgresStore {
    pool: DatabasePool,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = conversations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ConversationRecord {
    id: Uuid,
    created_at: DateTime<Utc>,
    request_type: String,
    metadata: Option<serde_json::Value>,
}

impl From<ConversationRecord> for Conversation {
    fn from(record: ConversationRecord) -> Self {
        Conversation {
            id: record.id.into(),
            created_at: record.created_at,
            request_type: record.request_type,
            metadata: record.metadata.and_then(into_metadata),
        }
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = branches)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct BranchRecord {
    id: Uuid,
    conversation_id: Uuid,
    parent_branch_id: Option<Uuid>,
    parent_message_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<BranchRecord> for Branch {
    fn from(record: BranchRecord) -> Self {
        Branch {
            id: record.id.into(),
            conversation_id: record.conversation_id.into(),
            parent_branch_id: record.parent_branch_id.map(Into::into),
            parent_message_id: record.parent_message_id.map(Into::into),
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    branch_id: Uuid,
    role: String,
    content: String,
    model: Option<String>,
    sequence_number: i32,
    cumulative_hash: String,
    created_at: DateTime<Utc>,
    child_branch_ids: Vec<Uuid>,
    upstream_status_code: Option<i32>,
    upstream_error: Option<String>,
    prompt_tokens: Option<i32>,
    completion_tokens: Option<i32>,
    prompt_eval_duration: Option<i64>,
    eval_duration: Option<i64>,
    parent_message_id: Option<Uuid>,
    client_host: Option<String>,
    upstream_host: Option<String>,
    metadata: Option<serde_json::Value>,
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Message {
            id: record.id.into(),
            conversation_id: record.conversation_id.into(),
            branch_id: record.branch_id.into(),
            sequence_number: record.sequence_number,
            cumulative_hash: record.cumulative_hash,
            created_at: record.created_at,
            child_branch_ids: record.child_branch_ids.into_iter().map(Into::into).collect(),
            parent_message_id: record.parent_message_id.map(Into::into),
            upstream_status_code: record.upstream_status_code,
            upstream_error: record.upstream_error,
            detail: SimpleMessage {
                role: record.role,
                content: record.content,
                model: record.model,
                prompt_tokens: record.prompt_tokens,
                completion_tokens: record.completion_tokens,
                prompt_eval_duration: record.prompt_eval_duration,
                eval_duration: record.eval_duration,
                client_host: record.client_host,
                upstream_host: record.upstream_host,
                tool_calls: Vec::new(),
                tool_call_id: None,
                metadata: record.metadata.and_then(into_metadata),
            },
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
struct MessageInsert<'a> {
    conversation_id: Uuid,
    branch_id: Uuid,
    role: &'a str,
    content: &'a str,
    model: Option<&'a str>,
    sequence_number: i32,
    cumulative_hash: String,
    upstream_status_code: Option<i32>,
    upstream_error: Option<&'a str>,
    prompt_tokens: Option<i32>,
    completion_tokens: Option<i32>,
    prompt_eval_duration: Option<i64>,
    eval_duration: Option<i64>,
    parent_message_id: Option<Uuid>,
    client_host: Option<&'a str>,
    upstream_host: Option<&'a str>,
    metadata: Option<serde_json::Value>,
}

fn into_metadata(value: serde_json::Value) -> Option<Metadata> {
    match value {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

const BRANCH_HISTORY_SQL: &str = r#"
    WITH RECURSIVE branch_path AS (
        SELECT id, parent_branch_id, parent_message_id, 0 AS level
        FROM branches WHERE id = $1
        UNION ALL
        SELECT b.id, b.parent_branch_id, b.parent_message_id, bp.level + 1
        FROM branches b
        JOIN branch_path bp ON b.id = bp.parent_branch_id
    )
    SELECT m.id, m.conversation_id, m.branch_id, m.role, m.content, m.model,
           m.sequence_number, m.cumulative_hash, m.created_at, m.child_branch_ids,
           m.upstream_status_code, m.upstream_error, m.prompt_tokens,
           m.completion_tokens, m.prompt_eval_duration, m.eval_duration,
           m.parent_message_id, m.client_host, m.upstream_host, m.metadata
    FROM messages m
    JOIN branch_path bp ON m.branch_id = bp.id
    WHERE bp.level = 0
       OR m.sequence_number <= (
            SELECT m2.sequence_number FROM messages m2
            WHERE m2.id = (
                SELECT bp2.parent_message_id FROM branch_path bp2
                WHERE bp2.level = bp.level - 1
            )
       )
    ORDER BY m.sequence_number ASC
"#;

impl PostgresStore {
    /// Connects to the database, creating the pool and applying any pending
    /// migrations.
    pub fn connect(dsn: &str) -> Result<Self> {
        let pool = DatabasePool::try_from(PoolConfig::new(dsn))
            .context("failed to initialize postgres storage")?;
        Ok(Self { pool })
    }

    fn insert_message(
        conn: &mut PgConnection,
        parent_message_id: Option<MessageId>,
        message: &NewMessage,
    ) -> Result<MessageRecord> {
        let (branch_id, last_hash, last_seq, parent_uuid) = match parent_message_id {
            Some(parent_id) => {
                // The parent row serialises concurrent appends: whoever
                // locks it first decides whether the other append forks.
                let (mut branch_id, last_hash, last_seq): (Uuid, String, i32) = messages::table
                    .find(parent_id.as_uuid())
                    .select((
                        messages::branch_id,
                        messages::cumulative_hash,
                        messages::sequence_number,
                    ))
                    .for_update()
                    .first(conn)?;

                let has_children: bool = diesel::select(diesel::dsl::exists(
                    messages::table.filter(messages::parent_message_id.eq(parent_id.as_uuid())),
                ))
                .get_result(conn)?;

                if has_children {
                    let conversation_id: Uuid = branches::table
                        .find(branch_id)
                        .select(branches::conversation_id)
                        .first(conn)?;

                    let forked: BranchRecord = diesel::insert_into(branches::table)
                        .values((
                            branches::conversation_id.eq(conversation_id),
                            branches::parent_branch_id.eq(branch_id),
                            branches::parent_message_id.eq(parent_id.as_uuid()),
                        ))
                        .returning(BranchRecord::as_returning())
                        .get_result(conn)?;

                    diesel::sql_query(
                        "UPDATE messages SET child_branch_ids = array_append(child_branch_ids, $1) WHERE id = $2",
                    )
                    .bind::<SqlUuid, _>(forked.id)
                    .bind::<SqlUuid, _>(parent_id.as_uuid())
                    .execute(conn)?;

                    branch_id = forked.id;
                }

                (branch_id, last_hash, last_seq, Some(parent_id.as_uuid()))
            }
            None => {
                let branch_id = message
                    .branch_id
                    .ok_or(lmtap_domain::Error::MissingBranch)?;
                (branch_id.as_uuid(), String::new(), 0, None)
            }
        };

        let conversation_id: Uuid = branches::table
            .find(branch_id)
            .select(branches::conversation_id)
            .first(conn)?;

        let detail = &message.detail;
        let insert = MessageInsert {
            conversation_id,
            branch_id,
            role: &detail.role,
            content: &detail.content,
            model: detail.model.as_deref(),
            sequence_number: last_seq + 1,
            cumulative_hash: chain_hash(&last_hash, &detail.role, &detail.content),
            upstream_status_code: message.upstream_status_code,
            upstream_error: message.upstream_error.as_deref(),
            prompt_tokens: detail.prompt_tokens,
            completion_tokens: detail.completion_tokens,
            prompt_eval_duration: detail.prompt_eval_duration,
            eval_duration: detail.eval_duration,
            parent_message_id: parent_uuid,
            client_host: detail.client_host.as_deref(),
            upstream_host: detail.upstream_host.as_deref(),
            metadata: detail
                .metadata_for_persistence()
                .map(serde_json::Value::Object),
        };

        let record = diesel::insert_into(messages::table)
            .values(&insert)
            .returning(MessageRecord::as_returning())
            .get_result(conn)?;

        Ok(record)
    }
}

#[async_trait]
impl ConversationStore for PostgresStore {
    async fn create_conversation(
        &self,
        metadata: Option<Metadata>,
        request_type: &str,
    ) -> Result<(Conversation, Branch)> {
        let mut conn = self.pool.get_connection()?;
        let metadata = metadata.map(serde_json::Value::Object);

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            let conversation: ConversationRecord = diesel::insert_into(conversations::table)
                .values((
                    conversations::request_type.eq(request_type),
                    conversations::metadata.eq(metadata),
                ))
                .returning(ConversationRecord::as_returning())
                .get_result(conn)?;

            let branch: BranchRecord = diesel::insert_into(branches::table)
                .values(branches::conversation_id.eq(conversation.id))
                .returning(BranchRecord::as_returning())
                .get_result(conn)?;

            Ok((conversation.into(), branch.into()))
        })
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let mut conn = self.pool.get_connection()?;

        let record: Option<ConversationRecord> = conversations::table
            .find(id.as_uuid())
            .select(ConversationRecord::as_select())
            .first(&mut conn)
            .optional()?;

        Ok(record.map(Into::into))
    }

    async fn add_message(
        &self,
        parent_message_id: Option<MessageId>,
        message: NewMessage,
    ) -> Result<Message> {
        let mut conn = self.pool.get_connection()?;

        let record = conn.transaction::<_, anyhow::Error, _>(|conn| {
            Self::insert_message(conn, parent_message_id, &message)
        })?;

        Ok(record.into())
    }

    async fn get_branch_history(&self, branch_id: BranchId) -> Result<Vec<Message>> {
        let mut conn = self.pool.get_connection()?;

        let records: Vec<MessageRecord> = diesel::sql_query(BRANCH_HISTORY_SQL)
            .bind::<SqlUuid, _>(branch_id.as_uuid())
            .load(&mut conn)?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn find_message_by_history(
        &self,
        history: &[SimpleMessage],
        request_type: &str,
    ) -> Result<Option<MessageId>> {
        if history.is_empty() {
            return Ok(None);
        }

        let hash = history_hash(history);
        let mut conn = self.pool.get_connection()?;

        let found: Option<Uuid> = messages::table
            .inner_join(conversations::table)
            .filter(messages::cumulative_hash.eq(&hash))
            .filter(conversations::request_type.eq(request_type))
            .order(messages::created_at.desc())
            .select(messages::id)
            .first(&mut conn)
            .optional()?;

        Ok(found.map(Into::into))
    }

    async fn list_conversations(&self, page: Pagination) -> Result<Vec<ConversationOverview>> {
        let page = page.normalize();
        let mut conn = self.pool.get_connection()?;

        let records: Vec<ConversationRecord> = conversations::table
            .select(ConversationRecord::as_select())
            .order(conversations::created_at.desc())
            .limit(page.limit)
            .offset(page.offset)
            .load(&mut conn)?;

        let ids: Vec<Uuid> = records.iter().map(|c| c.id).collect();

        let first_messages: Vec<MessageRecord> = messages::table
            .filter(messages::conversation_id.eq_any(&ids))
            .filter(messages::role.ne("system"))
            .select(MessageRecord::as_select())
            .distinct_on(messages::conversation_id)
            .order((
                messages::conversation_id.asc(),
                messages::sequence_number.asc(),
            ))
            .load(&mut conn)?;

        let system_prompts: Vec<MessageRecord> = messages::table
            .filter(messages::conversation_id.eq_any(&ids))
            .filter(messages::role.eq("system"))
            .select(MessageRecord::as_select())
            .distinct_on(messages::conversation_id)
            .order((
                messages::conversation_id.asc(),
                messages::sequence_number.asc(),
            ))
            .load(&mut conn)?;

        let mut firsts: HashMap<Uuid, MessageRecord> = first_messages
            .into_iter()
            .map(|m| (m.conversation_id, m))
            .collect();
        let mut systems: HashMap<Uuid, MessageRecord> = system_prompts
            .into_iter()
            .map(|m| (m.conversation_id, m))
            .collect();

        Ok(records
            .into_iter()
            .map(|record| {
                let first_message = firsts.remove(&record.id).map(Into::into);
                let system_prompt = systems.remove(&record.id).map(Into::into);
                ConversationOverview {
                    conversation: record.into(),
                    system_prompt,
                    first_message,
                }
            })
            .collect())
    }

    async fn search_messages(&self, query: &str, page: Pagination) -> Result<Vec<Message>> {
        let page = page.normalize();
        let mut conn = self.pool.get_connection()?;

        let pattern = format!("%{query}%");
        let records: Vec<MessageRecord> = messages::table
            .filter(messages::content.ilike(pattern))
            .select(MessageRecord::as_select())
            .order(messages::created_at.desc())
            .limit(page.limit)
            .offset(page.offset)
            .load(&mut conn)?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>> {
        let mut conn = self.pool.get_connection()?;

        let records: Vec<MessageRecord> = messages::table
            .filter(messages::conversation_id.eq(conversation_id.as_uuid()))
            .select(MessageRecord::as_select())
            .order((
                messages::sequence_number.asc(),
                messages::created_at.asc(),
            ))
            .load(&mut conn)?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn get_branch(&self, branch_id: BranchId) -> Result<Option<Branch>> {
        let mut conn = self.pool.get_connection()?;

        let record: Option<BranchRecord> = branches::table
            .find(branch_id.as_uuid())
            .select(BranchRecord::as_select())
            .first(&mut conn)
            .optional()?;

        Ok(record.map(Into::into))
    }
}
