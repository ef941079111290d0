//! Per-table metadata kept in one backend map per table.
//!
//! Each list-valued attribute (`schema`, `indices`, ...) is a separate map
//! register so that, for example, adding an index and adding a foreign key to
//! the same table in concurrent transactions do not conflict.
//! `current_pk_value` is the map's counter field.

pub mod schema;
pub mod types;

use crate::catalog::schema::TableMetadata;
use crate::error::KvRelError;
use crate::storage::backend::{BackendTransaction, MapObject};
use crate::storage::key::{KeyTerm, catalog_summary_key};
use crate::storage::tx::Transaction;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use tracing::info;

pub const MAX_IDENTIFIER_LEN: usize = 128;

pub(crate) const SCHEMA_FIELD: &str = "schema";
pub(crate) const PRIMARY_KEY_FIELD: &str = "primary_key_field";
pub(crate) const INDICES_FIELD: &str = "indices";
pub(crate) const UNIQUE_INDICES_FIELD: &str = "unique_indices";
pub(crate) const FOREIGN_KEYS_FIELD: &str = "foreign_keys";
pub(crate) const INCOMING_FOREIGN_KEYS_FIELD: &str = "incoming_foreign_keys";
pub(crate) const CURRENT_PK_FIELD: &str = "current_pk_value";

fn metadata_key(table: &str) -> String {
    KeyTerm::Table {
        table: table.to_string(),
    }
    .encode()
}

pub async fn create_table<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    name: &str,
    schema: &[String],
) -> Result<TableMetadata, KvRelError> {
    validate_identifier(name, name, "table name")?;
    if schema.is_empty() {
        return Err(KvRelError::InvalidSchema {
            table: name.to_string(),
            reason: "schema must name at least the primary key field".into(),
        });
    }
    let mut seen = BTreeSet::new();
    for field in schema {
        validate_identifier(name, field, "field name")?;
        if !seen.insert(field.as_str()) {
            return Err(KvRelError::InvalidSchema {
                table: name.to_string(),
                reason: format!("duplicate field '{field}'"),
            });
        }
    }
    if get_metadata(tx, name).await?.is_some() {
        return Err(KvRelError::SchemaConflict {
            table: name.to_string(),
            name: name.to_string(),
        });
    }

    let meta = TableMetadata::new(name, schema.to_vec());
    tx.update_map(
        &metadata_key(name),
        vec![
            (SCHEMA_FIELD.to_string(), rmp_serde::to_vec(&meta.schema)?),
            (
                PRIMARY_KEY_FIELD.to_string(),
                rmp_serde::to_vec(&meta.primary_key_field)?,
            ),
            (INDICES_FIELD.to_string(), rmp_serde::to_vec(&meta.indices)?),
            (
                UNIQUE_INDICES_FIELD.to_string(),
                rmp_serde::to_vec(&meta.unique_indices)?,
            ),
            (
                FOREIGN_KEYS_FIELD.to_string(),
                rmp_serde::to_vec(&meta.foreign_keys)?,
            ),
            (
                INCOMING_FOREIGN_KEYS_FIELD.to_string(),
                rmp_serde::to_vec(&meta.incoming_foreign_keys)?,
            ),
        ],
    )
    .await?;

    let mut tables = list_tables(tx).await?;
    tables.push(name.to_string());
    tx.put_register(catalog_summary_key(), rmp_serde::to_vec(&tables)?)
        .await?;

    info!(table = %name, fields = ?meta.schema, primary_key = %meta.primary_key_field, "table created");
    Ok(meta)
}

/// `None` when no table of that name is visible to the transaction.
pub async fn get_metadata<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    name: &str,
) -> Result<Option<TableMetadata>, KvRelError> {
    let map = tx.read_map(&metadata_key(name)).await?;
    if map.register(SCHEMA_FIELD).is_none() {
        return Ok(None);
    }
    let current = map.counter(CURRENT_PK_FIELD);
    Ok(Some(TableMetadata {
        name: name.to_string(),
        schema: decode_field(&map, SCHEMA_FIELD)?,
        primary_key_field: decode_field(&map, PRIMARY_KEY_FIELD)?,
        current_pk_value: u64::try_from(current).unwrap_or(0),
        indices: decode_field(&map, INDICES_FIELD)?,
        unique_indices: decode_field(&map, UNIQUE_INDICES_FIELD)?,
        foreign_keys: decode_field(&map, FOREIGN_KEYS_FIELD)?,
        incoming_foreign_keys: decode_field(&map, INCOMING_FOREIGN_KEYS_FIELD)?,
    }))
}

/// Like [`get_metadata`] but fails with `NoSuchTable`.
pub async fn describe_table<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    name: &str,
) -> Result<TableMetadata, KvRelError> {
    get_metadata(tx, name)
        .await?
        .ok_or_else(|| KvRelError::NoSuchTable {
            table: name.to_string(),
        })
}

/// Empty when the table does not exist.
pub async fn get_schema<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    name: &str,
) -> Result<Vec<String>, KvRelError> {
    Ok(get_metadata(tx, name)
        .await?
        .map(|meta| meta.schema)
        .unwrap_or_default())
}

pub async fn get_pk_field<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    name: &str,
) -> Result<String, KvRelError> {
    Ok(describe_table(tx, name).await?.primary_key_field)
}

pub async fn get_current_key<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    name: &str,
) -> Result<u64, KvRelError> {
    Ok(describe_table(tx, name).await?.current_pk_value)
}

/// True iff `fields` covers every schema field.
pub async fn validate_schema<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    name: &str,
    fields: &[String],
) -> Result<bool, KvRelError> {
    let schema = get_schema(tx, name).await?;
    Ok(!schema.is_empty() && schema.iter().all(|f| fields.contains(f)))
}

/// True iff every one of `fields` is a schema field.
pub async fn validate_schema_subset<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    name: &str,
    fields: &[String],
) -> Result<bool, KvRelError> {
    let schema = get_schema(tx, name).await?;
    Ok(!schema.is_empty() && fields.iter().all(|f| schema.contains(f)))
}

/// Allocates the next primary key. The increment is not undone if the
/// transaction later aborts, so keys are never reused.
pub async fn fetch_add_primary_key<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    name: &str,
) -> Result<u64, KvRelError> {
    describe_table(tx, name).await?;
    let next = tx.fetch_add(&metadata_key(name), CURRENT_PK_FIELD, 1).await?;
    u64::try_from(next).map_err(|_| KvRelError::Backend(format!("negative primary key counter {next}")))
}

/// Table names in creation order.
pub async fn list_tables<T: BackendTransaction>(
    tx: &mut Transaction<T>,
) -> Result<Vec<String>, KvRelError> {
    match tx.get_register(catalog_summary_key()).await? {
        Some(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
        None => Ok(Vec::new()),
    }
}

/// Rewrites one list-valued metadata attribute.
pub(crate) async fn put_metadata_field<T, V>(
    tx: &mut Transaction<T>,
    table: &str,
    field: &str,
    value: &V,
) -> Result<(), KvRelError>
where
    T: BackendTransaction,
    V: Serialize,
{
    tx.update_map(
        &metadata_key(table),
        vec![(field.to_string(), rmp_serde::to_vec(value)?)],
    )
    .await
}

fn decode_field<V: DeserializeOwned + Default>(map: &MapObject, field: &str) -> Result<V, KvRelError> {
    match map.register(field) {
        Some(bytes) => Ok(rmp_serde::from_slice(bytes)?),
        None => Ok(V::default()),
    }
}

pub(crate) fn validate_identifier(table: &str, value: &str, what: &str) -> Result<(), KvRelError> {
    let invalid = |reason: String| KvRelError::InvalidSchema {
        table: table.to_string(),
        reason,
    };
    if value.is_empty() {
        return Err(invalid(format!("{what} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid(format!(
            "{what} must be <= {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid(format!("{what} must contain only [A-Za-z0-9_-]")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        create_table, fetch_add_primary_key, get_current_key, get_pk_field, get_schema,
        list_tables, validate_schema, validate_schema_subset,
    };
    use crate::storage::memory::MemoryBackend;
    use crate::storage::tx::Transaction;
    use std::time::Duration;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_and_read_back() {
        let backend = MemoryBackend::new();
        let mut tx = Transaction::begin(&backend, "b", Duration::from_secs(5))
            .await
            .expect("begin");
        create_table(&mut tx, "A", &fields(&["idA", "fieldA"]))
            .await
            .expect("create");
        assert_eq!(get_schema(&mut tx, "A").await.expect("schema"), fields(&["idA", "fieldA"]));
        assert_eq!(get_pk_field(&mut tx, "A").await.expect("pk"), "idA");
        assert_eq!(get_current_key(&mut tx, "A").await.expect("current"), 0);
        assert!(get_schema(&mut tx, "missing").await.expect("schema").is_empty());
        assert_eq!(
            get_pk_field(&mut tx, "missing").await.expect_err("absent").code_str(),
            "no_such_table"
        );
        tx.commit().await.expect("commit");

        let mut tx = Transaction::begin(&backend, "b", Duration::from_secs(5))
            .await
            .expect("begin");
        assert_eq!(list_tables(&mut tx).await.expect("list"), vec!["A".to_string()]);
        let err = create_table(&mut tx, "A", &fields(&["x"]))
            .await
            .expect_err("exists");
        assert_eq!(err.code_str(), "schema_conflict");
    }

    #[tokio::test]
    async fn schema_validation() {
        let backend = MemoryBackend::new();
        let mut tx = Transaction::begin(&backend, "b", Duration::from_secs(5))
            .await
            .expect("begin");
        create_table(&mut tx, "A", &fields(&["idA", "fieldA", "other"]))
            .await
            .expect("create");
        assert!(validate_schema(&mut tx, "A", &fields(&["idA", "fieldA", "other"])).await.expect("v"));
        assert!(!validate_schema(&mut tx, "A", &fields(&["fieldA"])).await.expect("v"));
        assert!(validate_schema_subset(&mut tx, "A", &fields(&["fieldA"])).await.expect("v"));
        assert!(!validate_schema_subset(&mut tx, "A", &fields(&["nope"])).await.expect("v"));
        assert!(!validate_schema_subset(&mut tx, "missing", &fields(&[])).await.expect("v"));

        for bad in [vec![], fields(&["a", "a"]), fields(&["bad name"])] {
            let err = create_table(&mut tx, "B", &bad).await.expect_err("invalid");
            assert_eq!(err.code_str(), "invalid_schema");
        }
        let err = create_table(&mut tx, "a/b", &fields(&["id"])).await.expect_err("invalid");
        assert_eq!(err.code_str(), "invalid_schema");
    }

    #[tokio::test]
    async fn primary_keys_increase_and_are_not_reused_after_abort() {
        let backend = MemoryBackend::new();
        let mut tx = Transaction::begin(&backend, "b", Duration::from_secs(5))
            .await
            .expect("begin");
        create_table(&mut tx, "A", &fields(&["idA", "fieldA"]))
            .await
            .expect("create");
        tx.commit().await.expect("commit");

        let mut tx = Transaction::begin(&backend, "b", Duration::from_secs(5))
            .await
            .expect("begin");
        assert_eq!(fetch_add_primary_key(&mut tx, "A").await.expect("pk"), 1);
        assert_eq!(get_current_key(&mut tx, "A").await.expect("current"), 1);
        tx.abort().await.expect("abort");

        let mut tx = Transaction::begin(&backend, "b", Duration::from_secs(5))
            .await
            .expect("begin");
        assert_eq!(fetch_add_primary_key(&mut tx, "A").await.expect("pk"), 2);
        assert_eq!(
            fetch_add_primary_key(&mut tx, "missing").await.expect_err("absent").code_str(),
            "no_such_table"
        );
    }
}
