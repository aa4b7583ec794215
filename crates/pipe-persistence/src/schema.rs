//! Esquema Diesel (escrito a mano). Reemplazable con `diesel print-schema`.

diesel::table! {
    pipeline_documents (path) {
        path -> Text,
        collection -> Text,
        document_id -> Text,
        parent_id -> Nullable<Text>,
        fields -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
