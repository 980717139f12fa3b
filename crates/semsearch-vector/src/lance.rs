//! LanceDB-backed [`IndexStore`].
//!
//! All namespaces share one table keyed by `(namespace, position)`. A replace
//! is a single `merge_insert` that upserts the new rows and deletes the
//! namespace's leftover rows in the same commit, so readers never see a
//! half-written namespace.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result as AnyResult};
use arrow_array::types::Float32Type;
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, RecordBatchIterator, StringArray,
    TimestampMillisecondArray,
};
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{connect, Connection, Table};
use tracing::{debug, info};

use semsearch_core::error::{Error, Result};
use semsearch_core::traits::{IndexStore, Snapshot};
use semsearch_core::types::{ChunkMetadata, IndexedVector};

use crate::schema::{build_chunks_schema, vector_dim};

/// Rows per record batch handed to a single merge.
pub const WRITE_BATCH_ROWS: usize = 100;

#[derive(Debug, Clone)]
pub struct LanceStore {
    uri: String,
    table: String,
    dim: usize,
}

impl LanceStore {
    /// Connect to `uri`, creating `table` for `dim`-wide vectors if missing.
    /// An existing table with another vector width is rejected.
    pub fn open(uri: &str, table: &str, dim: usize) -> Result<Self> {
        let store = Self { uri: uri.to_string(), table: table.to_string(), dim };
        let width = i32::try_from(dim).map_err(|_| Error::InvalidConfig(format!("dimension {dim} too large")))?;
        let stored = block_on(async {
            let conn = connect(&store.uri).execute().await?;
            ensure_table(&conn, &store.table, build_chunks_schema(width)).await?;
            let t = conn.open_table(&store.table).execute().await?;
            Ok(vector_dim(&*t.schema().await?))
        })
        .map_err(Error::storage)?;
        match stored {
            Some(actual) if actual != dim => return Err(Error::DimensionMismatch { expected: dim, actual }),
            None => return Err(Error::storage(anyhow!("table {} has no vector column", store.table))),
            _ => {}
        }
        info!(uri = %store.uri, table = %store.table, dim, "opened lance store");
        Ok(store)
    }

    async fn open_table(&self) -> AnyResult<Table> {
        let conn = connect(&self.uri).execute().await?;
        Ok(conn.open_table(&self.table).execute().await?)
    }

    fn to_batches(&self, namespace: &str, records: &[IndexedVector]) -> AnyResult<Vec<RecordBatch>> {
        let width = i32::try_from(self.dim)?;
        let schema = build_chunks_schema(width);
        let now = Utc::now().timestamp_millis();
        records
            .chunks(WRITE_BATCH_ROWS)
            .map(|rows| {
                let int = |f: fn(&ChunkMetadata) -> usize| -> AnyResult<Int32Array> {
                    rows.iter()
                        .map(|r| i32::try_from(f(&r.metadata)).map_err(anyhow::Error::from))
                        .collect::<AnyResult<Vec<i32>>>()
                        .map(Int32Array::from)
                };
                let opt = |f: fn(&ChunkMetadata) -> Option<usize>| -> Int32Array {
                    rows.iter().map(|r| f(&r.metadata).and_then(|v| i32::try_from(v).ok())).collect()
                };
                let batch = RecordBatch::try_new(
                    schema.clone(),
                    vec![
                        Arc::new(StringArray::from_iter_values(rows.iter().map(|_| namespace))),
                        Arc::new(int(|m| m.position)?),
                        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.metadata.text.as_str()))),
                        Arc::new(int(|m| m.start_token)?),
                        Arc::new(int(|m| m.end_token)?),
                        Arc::new(int(|m| m.token_count)?),
                        Arc::new(opt(|m| m.char_start)),
                        Arc::new(opt(|m| m.char_end)),
                        Arc::new(StringArray::from_iter_values(
                            rows.iter().map(|r| blake3::hash(r.metadata.text.as_bytes()).to_hex().to_string()),
                        )),
                        Arc::new(TimestampMillisecondArray::from(vec![now; rows.len()])),
                        Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
                            rows.iter().map(|r| Some(r.vector.iter().copied().map(Some))),
                            width,
                        )),
                    ],
                )?;
                Ok(batch)
            })
            .collect()
    }
}

fn ns_filter(namespace: &str) -> String {
    format!("namespace = '{}'", namespace.replace('\'', "''"))
}

impl IndexStore for LanceStore {
    fn name(&self) -> &'static str {
        "lancedb"
    }

    fn replace(&self, namespace: &str, records: Vec<IndexedVector>) -> Result<()> {
        let batches = self.to_batches(namespace, &records).map_err(Error::storage)?;
        let schema = build_chunks_schema(i32::try_from(self.dim).map_err(|e| Error::storage(e.into()))?);
        block_on(async {
            let table = self.open_table().await?;
            let reader = Box::new(RecordBatchIterator::new(batches.into_iter().map(Ok), schema));
            let mut mi = table.merge_insert(&["namespace", "position"]);
            mi.when_matched_update_all(None)
                .when_not_matched_insert_all()
                .when_not_matched_by_source_delete(Some(ns_filter(namespace)));
            let _ = mi.execute(reader).await?;
            Ok(())
        })
        .map_err(Error::storage)?;
        debug!(namespace, rows = records.len(), "replaced namespace in lance table");
        Ok(())
    }

    fn snapshot(&self, namespace: &str) -> Result<Option<Snapshot>> {
        let mut rows = block_on(async {
            let table = self.open_table().await?;
            let mut stream = table.query().only_if(ns_filter(namespace)).execute().await?;
            let mut out = Vec::new();
            while let Some(batch) = stream.try_next().await? {
                read_rows(&batch, &mut out)?;
            }
            Ok(out)
        })
        .map_err(Error::storage)?;
        if rows.is_empty() {
            return Ok(None);
        }
        if let Some(bad) = rows.iter().find(|r| r.vector.len() != self.dim) {
            return Err(Error::DimensionMismatch { expected: self.dim, actual: bad.vector.len() });
        }
        rows.sort_by_key(|r| r.metadata.position);
        Ok(Some(rows.into()))
    }

    fn clear(&self, namespace: Option<&str>) -> Result<()> {
        let predicate = namespace.map_or_else(|| "namespace IS NOT NULL".to_string(), ns_filter);
        block_on(async {
            let table = self.open_table().await?;
            table.delete(&predicate).await?;
            Ok(())
        })
        .map_err(Error::storage)
    }

    fn namespaces(&self) -> Result<BTreeMap<String, usize>> {
        block_on(async {
            let table = self.open_table().await?;
            let mut stream = table.query().select(Select::columns(&["namespace"])).execute().await?;
            let mut counts = BTreeMap::new();
            while let Some(batch) = stream.try_next().await? {
                let col = string_col(&batch, "namespace")?;
                for i in 0..batch.num_rows() {
                    *counts.entry(col.value(i).to_string()).or_insert(0) += 1;
                }
            }
            Ok(counts)
        })
        .map_err(Error::storage)
    }
}

pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<arrow_schema::Schema>) -> AnyResult<()> {
    let names = conn.table_names().execute().await?;
    if names.iter().any(|n| n == name) {
        return Ok(());
    }
    // create empty table with 0 rows
    conn.create_empty_table(name, schema).execute().await?;
    Ok(())
}

fn string_col<'a>(batch: &'a RecordBatch, name: &str) -> AnyResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow!("missing {name} column"))
}

fn int_col<'a>(batch: &'a RecordBatch, name: &str) -> AnyResult<&'a Int32Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
        .ok_or_else(|| anyhow!("missing {name} column"))
}

fn read_rows(batch: &RecordBatch, out: &mut Vec<IndexedVector>) -> AnyResult<()> {
    let positions = int_col(batch, "position")?;
    let texts = string_col(batch, "text")?;
    let starts = int_col(batch, "start_token")?;
    let ends = int_col(batch, "end_token")?;
    let counts = int_col(batch, "token_count")?;
    let char_starts = int_col(batch, "char_start")?;
    let char_ends = int_col(batch, "char_end")?;
    let vectors = batch
        .column_by_name("vector")
        .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
        .ok_or_else(|| anyhow!("missing vector column"))?;

    let usize_at = |a: &Int32Array, i: usize| usize::try_from(a.value(i)).map_err(|e| anyhow!("negative offset: {e}"));
    let opt_at = |a: &Int32Array, i: usize| (!a.is_null(i)).then(|| a.value(i)).and_then(|v| usize::try_from(v).ok());

    for i in 0..batch.num_rows() {
        let values = vectors.value(i);
        let floats = values
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| anyhow!("invalid vector type"))?;
        out.push(IndexedVector {
            vector: floats.values().to_vec(),
            metadata: ChunkMetadata {
                position: usize_at(positions, i)?,
                text: texts.value(i).to_string(),
                start_token: usize_at(starts, i)?,
                end_token: usize_at(ends, i)?,
                token_count: usize_at(counts, i)?,
                char_start: opt_at(char_starts, i),
                char_end: opt_at(char_ends, i),
            },
        });
    }
    Ok(())
}

/// Drive a lancedb future from synchronous code, reusing the ambient tokio
/// runtime when there is one. A current-thread runtime cannot be blocked on
/// from inside, so that case is an error.
fn block_on<F, T>(fut: F) -> AnyResult<T>
where
    F: Future<Output = AnyResult<T>>,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
            return Err(anyhow!("lance store needs a multi-threaded tokio runtime"));
        }
        tokio::task::block_in_place(|| handle.block_on(fut))
    } else {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        rt.block_on(fut)
    }
}
