use crate::catalog::describe_table;
use crate::catalog::schema::TableMetadata;
use crate::error::KvRelError;
use crate::query::plan::ScanStrategy;
use crate::storage::backend::BackendTransaction;
use crate::storage::tx::Transaction;
use tracing::debug;

/// Picks the cheapest access path for an equality predicate over
/// `predicate_fields`: unique index, then index, then primary key, then a
/// sequential pass. An index qualifies when all of its fields are
/// constrained; the first qualifying one in catalog order wins and is probed
/// through its first field.
pub fn choose_scan(meta: &TableMetadata, predicate_fields: &[String]) -> ScanStrategy {
    if let Some(index) = meta
        .unique_indices
        .iter()
        .find(|idx| idx.contained_in(predicate_fields))
        && let Some(field) = index.field_names.first()
    {
        return ScanStrategy::UniqueIndex {
            index: index.index_name.clone(),
            field: field.clone(),
        };
    }
    if let Some(index) = meta
        .indices
        .iter()
        .find(|idx| idx.contained_in(predicate_fields))
        && let Some(field) = index.field_names.first()
    {
        return ScanStrategy::Index {
            index: index.index_name.clone(),
            field: field.clone(),
        };
    }
    if predicate_fields.contains(&meta.primary_key_field) {
        return ScanStrategy::Fast {
            pk_field: meta.primary_key_field.clone(),
        };
    }
    ScanStrategy::Sequential
}

pub async fn select_scan<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    predicate_fields: &[String],
) -> Result<ScanStrategy, KvRelError> {
    let meta = describe_table(tx, table).await?;
    let strategy = choose_scan(&meta, predicate_fields);
    debug!(table = %table, fields = ?predicate_fields, strategy = strategy.name(), "scan selected");
    Ok(strategy)
}
