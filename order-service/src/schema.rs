diesel::table! {
    orders (id) {
        id -> Uuid,
        user_id -> Uuid,
        amount -> Numeric,
        description -> Varchar,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
        version -> Int4,
    }
}
