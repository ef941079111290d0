//! Secondary index maintenance.
//!
//! A regular index keeps, for every indexed `(field, value)`, a sentinel key
//! plus one entry per row holding that value; the rows are found by a subkey
//! scan under the sentinel. A unique index keeps a single key per
//! `(field, value)` whose payload is the owning primary key.

use crate::catalog::schema::{IndexDef, TableMetadata};
use crate::catalog::types::{Row, Value};
use crate::catalog::{
    INDICES_FIELD, UNIQUE_INDICES_FIELD, describe_table, put_metadata_field, validate_identifier,
};
use crate::error::KvRelError;
use crate::storage::backend::BackendTransaction;
use crate::storage::key::KeyTerm;
use crate::storage::tx::Transaction;
use tracing::info;

pub async fn add_index<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    index_name: &str,
    field_names: &[String],
) -> Result<IndexDef, KvRelError> {
    let mut meta = describe_table(tx, table).await?;
    let def = validated_def(&meta, index_name, field_names)?;
    meta.indices.push(def.clone());
    put_metadata_field(tx, table, INDICES_FIELD, &meta.indices).await?;
    info!(table = %table, index = %index_name, fields = ?field_names, "index created");
    Ok(def)
}

pub async fn add_unique_index<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    index_name: &str,
    field_names: &[String],
) -> Result<IndexDef, KvRelError> {
    let mut meta = describe_table(tx, table).await?;
    let def = validated_def(&meta, index_name, field_names)?;
    meta.unique_indices.push(def.clone());
    put_metadata_field(tx, table, UNIQUE_INDICES_FIELD, &meta.unique_indices).await?;
    info!(table = %table, index = %index_name, fields = ?field_names, "unique index created");
    Ok(def)
}

fn validated_def(
    meta: &TableMetadata,
    index_name: &str,
    field_names: &[String],
) -> Result<IndexDef, KvRelError> {
    validate_identifier(&meta.name, index_name, "index name")?;
    if field_names.is_empty() {
        return Err(KvRelError::InvalidSchema {
            table: meta.name.clone(),
            reason: format!("index '{index_name}' must cover at least one field"),
        });
    }
    if let Some(field) = field_names.iter().find(|f| !meta.has_field(f)) {
        return Err(KvRelError::InvalidField {
            table: meta.name.clone(),
            field: field.clone(),
        });
    }
    if meta.has_index_named(index_name) {
        return Err(KvRelError::SchemaConflict {
            table: meta.name.clone(),
            name: index_name.to_string(),
        });
    }
    Ok(IndexDef::new(index_name, field_names.iter().cloned()))
}

/// Indices sharing at least one field with `field_names`, in catalog order.
pub fn correlate(indices: &[IndexDef], field_names: &[String]) -> Vec<IndexDef> {
    let mut out: Vec<IndexDef> = Vec::new();
    for index in indices {
        if field_names.iter().any(|f| index.covers(f))
            && !out.iter().any(|seen| seen.index_name == index.index_name)
        {
            out.push(index.clone());
        }
    }
    out
}

pub async fn correlate_indices<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    field_names: &[String],
) -> Result<Vec<IndexDef>, KvRelError> {
    let meta = describe_table(tx, table).await?;
    Ok(correlate(&meta.indices, field_names))
}

pub async fn correlate_unique_indices<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    field_names: &[String],
) -> Result<Vec<IndexDef>, KvRelError> {
    let meta = describe_table(tx, table).await?;
    Ok(correlate(&meta.unique_indices, field_names))
}

fn sentinel(table: &str, index: &str, field: &str, value: &Value) -> KeyTerm {
    KeyTerm::IndexField {
        table: table.to_string(),
        index: index.to_string(),
        field: field.to_string(),
        value: value.clone(),
    }
}

fn entry(table: &str, index: &str, field: &str, value: &Value, pk: u64) -> KeyTerm {
    KeyTerm::IndexPrimaryKey {
        table: table.to_string(),
        index: index.to_string(),
        field: field.to_string(),
        value: value.clone(),
        pk,
    }
}

fn unique_entry(table: &str, index: &str, field: &str, value: &Value) -> KeyTerm {
    KeyTerm::UniqueIndex {
        table: table.to_string(),
        index: index.to_string(),
        field: field.to_string(),
        value: value.clone(),
    }
}

pub async fn update_indices<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    pk: u64,
    row: &Row,
) -> Result<(), KvRelError> {
    let indices = correlate_indices(tx, table, &row.field_names()).await?;
    let mut writes = Vec::new();
    for index in &indices {
        for field in &index.field_names {
            if let Some(value) = row.get(field) {
                writes.push((sentinel(table, &index.index_name, field, value), ()));
                writes.push((entry(table, &index.index_name, field, value, pk), ()));
            }
        }
    }
    tx.put(&writes).await
}

pub async fn update_unique_indices<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    pk: u64,
    row: &Row,
) -> Result<(), KvRelError> {
    let indices = correlate_unique_indices(tx, table, &row.field_names()).await?;
    for index in &indices {
        let writes: Vec<(KeyTerm, u64)> = index
            .field_names
            .iter()
            .filter_map(|field| {
                row.get(field)
                    .map(|value| (unique_entry(table, &index.index_name, field, value), pk))
            })
            .collect();
        match tx.cond_put(&writes, &pk).await {
            Ok(()) => {}
            Err(KvRelError::PreconditionFailed { .. }) => {
                return Err(KvRelError::UniquenessViolation {
                    table: table.to_string(),
                    index: index.index_name.clone(),
                });
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Drops this row's entries for the previous values of `updated_fields`.
pub async fn prune_indices<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    pk: u64,
    old_row: &Row,
    updated_fields: &[String],
) -> Result<(), KvRelError> {
    let indices = correlate_indices(tx, table, updated_fields).await?;
    for index in &indices {
        for field in index.field_names.iter().filter(|f| updated_fields.contains(f)) {
            let Some(value) = old_row.get(field) else {
                continue;
            };
            tx.remove(&[entry(table, &index.index_name, field, value, pk)])
                .await?;
            let sentinel = sentinel(table, &index.index_name, field, value);
            if tx.subkeys(&sentinel).await?.is_empty() {
                tx.remove(&[sentinel]).await?;
            }
        }
    }
    Ok(())
}

pub async fn prune_unique_indices<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    pk: u64,
    old_row: &Row,
    updated_fields: &[String],
) -> Result<(), KvRelError> {
    let indices = correlate_unique_indices(tx, table, updated_fields).await?;
    for index in &indices {
        for field in index.field_names.iter().filter(|f| updated_fields.contains(f)) {
            let Some(value) = old_row.get(field) else {
                continue;
            };
            let key = unique_entry(table, &index.index_name, field, value);
            let owner = tx.try_get::<u64>(std::slice::from_ref(&key)).await?;
            if owner.first().copied().flatten() == Some(pk) {
                tx.remove(&[key]).await?;
            }
        }
    }
    Ok(())
}

/// Primary keys of rows whose `field` equals `value`, ascending.
pub async fn lookup_index<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    index: &str,
    field: &str,
    value: &Value,
) -> Result<Vec<u64>, KvRelError> {
    let keys = tx.subkeys(&sentinel(table, index, field, value)).await?;
    let mut pks: Vec<u64> = keys
        .into_iter()
        .filter_map(|key| match key {
            KeyTerm::IndexPrimaryKey { pk, .. } => Some(pk),
            _ => None,
        })
        .collect();
    pks.sort_unstable();
    Ok(pks)
}

pub async fn lookup_unique_index<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    index: &str,
    field: &str,
    value: &Value,
) -> Result<Option<u64>, KvRelError> {
    let found = tx
        .try_get::<u64>(&[unique_entry(table, index, field, value)])
        .await?;
    Ok(found.into_iter().next().flatten())
}
