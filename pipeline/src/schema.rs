pub mod sql_types {
    #[derive(diesel::query_builder::QueryId, diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "asset_type", schema = "metadata"))]
    pub struct AssetType;
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::AssetType;

    metadata.dataset (id) {
        id -> Text,
        asset_type -> AssetType,
        name -> Text,
        description -> Text,
        is_official -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        parents -> Array<Text>,
        column_names -> Array<Text>,
        column_field_names -> Array<Text>,
        column_sql_names -> Array<Text>,
        column_types -> Array<Text>,
        column_descriptions -> Array<Text>,
    }
}

diesel::table! {
    queue (dataset_id) {
        dataset_id -> Text,
        freshness -> Timestamptz,
        scraped_at -> Nullable<Timestamptz>,
        processed_at -> Nullable<Timestamptz>,
        retries -> Int2,
    }
}

diesel::table! {
    raw_tables (dataset_id) {
        dataset_id -> Text,
        descriptor -> Jsonb,
        materialized_at -> Timestamptz,
    }
}

diesel::table! {
    inference.columns (dataset, column_name) {
        dataset -> Text,
        #[sql_name = "column"]
        column_name -> Text,
        #[sql_name = "unique"]
        is_unique -> Bool,
        distinct_count -> Int8,
        is_text -> Bool,
        min_len -> Int8,
        max_len -> Int8,
        min_text -> Text,
        max_text -> Text,
    }
}

diesel::table! {
    inference.inclusions (source_dataset, source_column, target_dataset, target_column) {
        source_dataset -> Text,
        source_column -> Text,
        target_dataset -> Text,
        target_column -> Text,
    }
}

diesel::joinable!(queue -> dataset (dataset_id));
diesel::joinable!(raw_tables -> dataset (dataset_id));

diesel::allow_tables_to_appear_in_same_query!(dataset, queue, raw_tables, columns, inclusions,);
