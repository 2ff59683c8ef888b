diesel::table! {
    conversations (id) {
        id -> Uuid,
        created_at -> Timestamptz,
        request_type -> Text,
        metadata -> Nullable<Jsonb>,
    }
}

diesel::table! {
    branches (id) {
        id -> Uuid,
        conversation_id -> Uuid,
        parent_branch_id -> Nullable<Uuid>,
        parent_message_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    messages (id) {
        id -> Uuid,
        conversation_id -> Uuid,
        branch_id -> Uuid,
        role -> Text,
        content -> Text,
        model -> Nullable<Text>,
        sequence_number -> Int4,
        cumulative_hash -> Text,
        created_at -> Timestamptz,
        child_branch_ids -> Array<Uuid>,
        upstream_status_code -> Nullable<Int4>,
        upstream_error -> Nullable<Text>,
        prompt_tokens -> Nullable<Int4>,
        completion_tokens -> Nullable<Int4>,
        prompt_eval_duration -> Nullable<Int8>,
        eval_duration -> Nullable<Int8>,
        parent_message_id -> Nullable<Uuid>,
        client_host -> Nullable<Text>,
        upstream_host -> Nullable<Text>,
        metadata -> Nullable<Jsonb>,
    }
}

diesel::joinable!(branches -> conversations (conversation_id));
diesel::joinable!(messages -> conversations (conversation_id));
diesel::joinable!(messages -> branches (branch_id));

diesel::allow_tables_to_appear_in_same_query!(conversations, branches, messages);
