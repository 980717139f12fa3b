use arrow_schema::{DataType, Field, Schema, TimeUnit};
use std::sync::Arc;

pub const VECTOR_COLUMN: &str = "vector";

pub fn build_chunks_schema(dim: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("namespace", DataType::Utf8, false),
        Field::new("position", DataType::Int32, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("start_token", DataType::Int32, false),
        Field::new("end_token", DataType::Int32, false),
        Field::new("token_count", DataType::Int32, false),
        Field::new("char_start", DataType::Int32, true),
        Field::new("char_end", DataType::Int32, true),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("indexed_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        Field::new(VECTOR_COLUMN, DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true),
    ]))
}

/// Vector width of an existing table, if it has a fixed-size vector column.
pub fn vector_dim(schema: &Schema) -> Option<usize> {
    match schema.field_with_name(VECTOR_COLUMN).ok()?.data_type() {
        DataType::FixedSizeList(_, n) => usize::try_from(*n).ok(),
        _ => None,
    }
}
