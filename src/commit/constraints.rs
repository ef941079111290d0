use crate::catalog::schema::{ForeignKey, ForeignKeyDef};
use crate::catalog::types::{Row, Value};
use crate::catalog::{
    FOREIGN_KEYS_FIELD, INCOMING_FOREIGN_KEYS_FIELD, describe_table, put_metadata_field,
};
use crate::error::KvRelError;
use crate::query::executor::select_rows;
use crate::query::plan::Predicate;
use crate::storage::backend::BackendTransaction;
use crate::storage::tx::Transaction;
use tracing::info;

/// Declares `table.alias -> reference_table.field_name` and mirrors it into
/// the parent's incoming list.
pub async fn create_foreign_key<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    def: ForeignKeyDef,
) -> Result<ForeignKey, KvRelError> {
    let fk = def.resolve();
    let mut child = describe_table(tx, table).await?;
    let mut parent = describe_table(tx, &fk.reference_table).await?;
    if !child.has_field(&fk.alias) {
        return Err(KvRelError::InvalidField {
            table: table.to_string(),
            field: fk.alias.clone(),
        });
    }
    if !parent.has_field(&fk.field_name) {
        return Err(KvRelError::InvalidField {
            table: fk.reference_table.clone(),
            field: fk.field_name.clone(),
        });
    }
    if child.foreign_keys.iter().any(|existing| existing.alias == fk.alias) {
        return Err(KvRelError::SchemaConflict {
            table: table.to_string(),
            name: fk.alias.clone(),
        });
    }

    child.foreign_keys.push(fk.clone());
    put_metadata_field(tx, table, FOREIGN_KEYS_FIELD, &child.foreign_keys).await?;
    parent.incoming_foreign_keys.push(ForeignKey {
        alias: fk.alias.clone(),
        field_name: fk.field_name.clone(),
        reference_table: table.to_string(),
    });
    put_metadata_field(
        tx,
        &fk.reference_table,
        INCOMING_FOREIGN_KEYS_FIELD,
        &parent.incoming_foreign_keys,
    )
    .await?;

    info!(
        table = %table,
        alias = %fk.alias,
        reference_table = %fk.reference_table,
        field_name = %fk.field_name,
        "foreign key created"
    );
    Ok(fk)
}

/// Every foreign key whose alias appears in `row` must resolve to an
/// existing parent row.
pub async fn check_outgoing_fks<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    row: &Row,
) -> Result<(), KvRelError> {
    let meta = describe_table(tx, table).await?;
    for fk in &meta.foreign_keys {
        let Some(value) = row.get(&fk.alias) else {
            continue;
        };
        let matches = probe(tx, &fk.reference_table, &fk.field_name, value).await?;
        if matches == 0 {
            return Err(KvRelError::ForeignKeyViolation {
                table: table.to_string(),
                alias: fk.alias.clone(),
                reference_table: fk.reference_table.clone(),
                field_name: fk.field_name.clone(),
                reason: format!("no parent row with {} = {value}", fk.field_name),
            });
        }
    }
    Ok(())
}

/// Refuses to change a referenced parent field while child rows still point
/// at its current value.
pub async fn check_incoming_fks<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    old_row: &Row,
    updated_fields: &[String],
) -> Result<(), KvRelError> {
    let meta = describe_table(tx, table).await?;
    for fk in &meta.incoming_foreign_keys {
        if !updated_fields.contains(&fk.field_name) {
            continue;
        }
        let Some(value) = old_row.get(&fk.field_name) else {
            continue;
        };
        let children = probe(tx, &fk.reference_table, &fk.alias, value).await?;
        if children > 0 {
            return Err(KvRelError::ForeignKeyViolation {
                table: fk.reference_table.clone(),
                alias: fk.alias.clone(),
                reference_table: table.to_string(),
                field_name: fk.field_name.clone(),
                reason: format!("{children} row(s) still reference {} = {value}", fk.field_name),
            });
        }
    }
    Ok(())
}

/// Number of rows in `table` with `field = value`. A primary key beyond the
/// table's counter simply matches nothing.
async fn probe<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    field: &str,
    value: &Value,
) -> Result<usize, KvRelError> {
    let meta = describe_table(tx, table).await?;
    let predicate = Predicate::new().equals(field, value.clone());
    match select_rows(tx, &meta, Some(&predicate)).await {
        Ok(rows) => Ok(rows.len()),
        Err(KvRelError::OutOfRange { .. }) => Ok(0),
        Err(err) => Err(err),
    }
}
