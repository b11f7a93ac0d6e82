// Ledger tables. The inbox and outbox tables live in `shared::schema`.

diesel::table! {
    accounts (id) {
        id -> Uuid,
        user_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    account_balances (account_id) {
        account_id -> Uuid,
        balance -> Numeric,
        version -> Int4,
    }
}

diesel::table! {
    account_transactions (id) {
        id -> Uuid,
        account_id -> Uuid,
        order_id -> Nullable<Uuid>,
        delta -> Numeric,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(account_balances -> accounts (account_id));
diesel::joinable!(account_transactions -> accounts (account_id));

diesel::allow_tables_to_appear_in_same_query!(
    accounts,
    account_balances,
    account_transactions,
);
