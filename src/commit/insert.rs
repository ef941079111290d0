use crate::catalog::types::{Row, Value};
use crate::catalog::{describe_table, fetch_add_primary_key, validate_schema};
use crate::commit::constraints::check_outgoing_fks;
use crate::error::KvRelError;
use crate::storage::backend::BackendTransaction;
use crate::storage::index::{update_indices, update_unique_indices};
use crate::storage::key::KeyTerm;
use crate::storage::tx::Transaction;
use tracing::debug;

/// Inserts one row and returns its newly allocated primary key.
///
/// The row names every schema field except the primary key, which is always
/// allocated here. On error the handle is marked failed and will refuse to
/// commit, since the row may be partly written.
pub async fn insert<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    row: Row,
) -> Result<u64, KvRelError> {
    let result = insert_row(tx, table, row).await;
    tx.settle(result)
}

async fn insert_row<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    row: Row,
) -> Result<u64, KvRelError> {
    let meta = describe_table(tx, table).await?;
    if row.contains(&meta.primary_key_field) {
        return Err(KvRelError::InvalidSchema {
            table: table.to_string(),
            reason: format!(
                "primary key field '{}' is allocated by the database",
                meta.primary_key_field
            ),
        });
    }
    let extra: Vec<String> = row
        .field_names()
        .into_iter()
        .filter(|f| !meta.has_field(f))
        .collect();
    if !extra.is_empty() {
        return Err(KvRelError::InvalidSchema {
            table: table.to_string(),
            reason: format!("unknown fields {extra:?}"),
        });
    }
    let mut provided = row.field_names();
    provided.push(meta.primary_key_field.clone());
    if !validate_schema(tx, table, &provided).await? {
        let missing: Vec<&String> = meta.non_key_fields().filter(|f| !row.contains(f)).collect();
        return Err(KvRelError::InvalidSchema {
            table: table.to_string(),
            reason: format!("missing fields {missing:?}"),
        });
    }

    check_outgoing_fks(tx, table, &row).await?;

    let pk = fetch_add_primary_key(tx, table).await?;
    tx.put(&[(
        KeyTerm::PrimaryKey {
            table: table.to_string(),
            pk,
        },
        pk,
    )])
    .await?;
    let fields: Vec<(KeyTerm, Value)> = row
        .fields
        .iter()
        .map(|(field, value)| {
            (
                KeyTerm::Field {
                    table: table.to_string(),
                    pk,
                    field: field.clone(),
                },
                value.clone(),
            )
        })
        .collect();
    tx.put(&fields).await?;

    let full = row.with(meta.primary_key_field.clone(), pk);
    update_indices(tx, table, pk, &full).await?;
    update_unique_indices(tx, table, pk, &full).await?;

    debug!(table = %table, pk, "row inserted");
    Ok(pk)
}
