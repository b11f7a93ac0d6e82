// Tables present in every service database.

diesel::table! {
    inbox_messages (id) {
        id -> Uuid,
        message_id -> Varchar,
        message_type -> Varchar,
        payload -> Jsonb,
        received_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
        attempt -> Int4,
        error -> Nullable<Text>,
    }
}

diesel::table! {
    outbox_messages (id) {
        id -> Uuid,
        message_type -> Varchar,
        payload -> Jsonb,
        created_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
        attempt -> Int4,
        error -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    inbox_messages,
    outbox_messages,
);
