table! {
    coupon_books (id) {
        id -> Uuid,
        name -> Varchar,
        description -> Nullable<Varchar>,
        is_active -> Bool,
        valid_from -> Timestamp,
        valid_until -> Timestamp,
        max_redemptions_per_user -> Nullable<Int4>,
        max_assignments_per_user -> Nullable<Int4>,
        code_pattern -> Nullable<Varchar>,
        max_codes -> Nullable<Int4>,
        total_codes -> Int4,
        metadata -> Jsonb,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    coupons (id) {
        id -> Uuid,
        coupon_book_id -> Uuid,
        code -> Varchar,
        status -> Varchar,
        version -> Int4,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    coupon_assignments (id) {
        id -> Uuid,
        coupon_id -> Uuid,
        user_id -> Varchar,
        assigned_at -> Timestamp,
        locked_at -> Nullable<Timestamp>,
        lock_expires_at -> Nullable<Timestamp>,
        redeemed_at -> Nullable<Timestamp>,
        redemption_count -> Int4,
        metadata -> Jsonb,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

joinable!(coupons -> coupon_books (coupon_book_id));
joinable!(coupon_assignments -> coupons (coupon_id));

allow_tables_to_appear_in_same_query!(coupon_books, coupons, coupon_assignments);
