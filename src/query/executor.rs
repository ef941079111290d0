use crate::catalog::describe_table;
use crate::catalog::schema::TableMetadata;
use crate::catalog::types::{Row, Value, prefix_field};
use crate::error::KvRelError;
use crate::query::plan::{Predicate, Projection, Query, ScanStrategy, UsingJoin};
use crate::query::planner::select_scan;
use crate::storage::backend::BackendTransaction;
use crate::storage::index::{lookup_index, lookup_unique_index};
use crate::storage::key::KeyTerm;
use crate::storage::tx::Transaction;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Filtered single-table select. Rows come back in primary key order.
pub async fn select<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    projection: &Projection,
    table: &str,
    predicate: Option<&Predicate>,
) -> Result<Vec<Row>, KvRelError> {
    let meta = describe_table(tx, table).await?;
    if let Projection::Fields(fields) = projection {
        let unknown: Vec<String> = fields.iter().filter(|f| !meta.has_field(f)).cloned().collect();
        if !unknown.is_empty() {
            return Err(KvRelError::InvalidQueryFields {
                table: table.to_string(),
                fields: unknown,
            });
        }
    }
    let rows = select_rows(tx, &meta, predicate).await?;
    Ok(rows
        .into_iter()
        .map(|(_, row)| projection.apply(row))
        .collect())
}

/// Full rows (primary key field included) matching `predicate`, paired with
/// their primary keys.
pub(crate) async fn select_rows<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    meta: &TableMetadata,
    predicate: Option<&Predicate>,
) -> Result<Vec<(u64, Row)>, KvRelError> {
    let empty = Predicate::new();
    let predicate = predicate.unwrap_or(&empty);
    let unknown: Vec<String> = predicate
        .fields()
        .into_iter()
        .filter(|f| !meta.has_field(f))
        .collect();
    if !unknown.is_empty() {
        return Err(KvRelError::InvalidPredicateFields {
            table: meta.name.clone(),
            fields: unknown,
        });
    }

    let pks = candidate_pks(tx, meta, predicate).await?;
    let rows = read_rows(tx, meta, &pks).await?;
    Ok(rows
        .into_iter()
        .filter(|(_, row)| predicate.matches(row))
        .collect())
}

async fn candidate_pks<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    meta: &TableMetadata,
    predicate: &Predicate,
) -> Result<Vec<u64>, KvRelError> {
    let strategy = select_scan(tx, &meta.name, &predicate.fields()).await?;
    let values = |field: &str| predicate.values_for(field).unwrap_or_default().to_vec();
    let mut pks = BTreeSet::new();
    match &strategy {
        ScanStrategy::UniqueIndex { index, field } => {
            for value in values(field) {
                if let Some(pk) = lookup_unique_index(tx, &meta.name, index, field, &value).await? {
                    pks.insert(pk);
                }
            }
        }
        ScanStrategy::Index { index, field } => {
            for value in values(field) {
                pks.extend(lookup_index(tx, &meta.name, index, field, &value).await?);
            }
        }
        ScanStrategy::Fast { pk_field } => {
            let current = meta.current_pk_value;
            for pk in values(pk_field).iter().filter_map(Value::as_primary_key) {
                if pk > current {
                    return Err(KvRelError::OutOfRange {
                        table: meta.name.clone(),
                        requested: pk,
                        current,
                    });
                }
                pks.insert(pk);
            }
        }
        ScanStrategy::Sequential => pks.extend(1..=meta.current_pk_value),
    }
    debug!(table = %meta.name, strategy = strategy.name(), candidates = pks.len(), "scan planned");
    Ok(pks.into_iter().collect())
}

/// Reads whole rows; allocated keys whose row was never committed are skipped.
async fn read_rows<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    meta: &TableMetadata,
    pks: &[u64],
) -> Result<Vec<(u64, Row)>, KvRelError> {
    let markers: Vec<KeyTerm> = pks
        .iter()
        .map(|&pk| KeyTerm::PrimaryKey {
            table: meta.name.clone(),
            pk,
        })
        .collect();
    let present: Vec<u64> = tx
        .try_get::<u64>(&markers)
        .await?
        .into_iter()
        .flatten()
        .collect();

    let fields: Vec<String> = meta.non_key_fields().cloned().collect();
    let keys: Vec<KeyTerm> = present
        .iter()
        .flat_map(|&pk| {
            fields.iter().map(move |field| KeyTerm::Field {
                table: meta.name.clone(),
                pk,
                field: field.clone(),
            })
        })
        .collect();
    let values: Vec<Value> = tx.get(&keys).await?;

    let mut rows = Vec::with_capacity(present.len());
    let mut values = values.into_iter();
    for pk in present {
        let mut row = Row::new();
        row.insert(meta.primary_key_field.clone(), Value::from(pk));
        for field in &fields {
            if let Some(value) = values.next() {
                row.insert(field.clone(), value);
            }
        }
        rows.push((pk, row));
    }
    Ok(rows)
}

/// Inner join of `tables` along the `using` pairs. Output fields are named
/// `table.field`.
pub async fn select_join<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    projection: &Projection,
    tables: &[String],
    using: &UsingJoin,
) -> Result<Vec<Row>, KvRelError> {
    validate_join(tables, using)?;

    let mut schemas = BTreeMap::new();
    for table in tables {
        let meta = describe_table(tx, table).await?;
        schemas.insert(table.clone(), meta);
    }
    for pair in &using.on {
        for (table, field) in [
            (&pair.left_table, &pair.left_field),
            (&pair.right_table, &pair.right_field),
        ] {
            if !schemas.get(table).is_some_and(|m| m.has_field(field)) {
                return Err(KvRelError::InvalidJoin(format!(
                    "join field {} is not in the schema",
                    prefix_field(table, field)
                )));
            }
        }
    }
    if let Projection::Fields(fields) = projection {
        let unknown: Vec<String> = fields
            .iter()
            .filter(|f| {
                !f.split_once('.').is_some_and(|(table, field)| {
                    schemas.get(table).is_some_and(|m| m.has_field(field))
                })
            })
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(KvRelError::InvalidQueryFields {
                table: tables.join(","),
                fields: unknown,
            });
        }
    }

    let mut per_table: BTreeMap<String, Vec<Row>> = BTreeMap::new();
    for (table, meta) in &schemas {
        let rows = select_rows(tx, meta, using.predicates.get(table)).await?;
        per_table.insert(
            table.clone(),
            rows.into_iter().map(|(_, row)| row.prefixed(table)).collect(),
        );
    }

    let Some(first) = using.on.first() else {
        return Err(KvRelError::InvalidJoin("no join pairs given".into()));
    };
    let mut joined: BTreeSet<&str> = BTreeSet::new();
    joined.insert(first.left_table.as_str());
    let mut acc = per_table.remove(&first.left_table).unwrap_or_default();

    for pair in &using.on {
        let left_key = prefix_field(&pair.left_table, &pair.left_field);
        let right_key = prefix_field(&pair.right_table, &pair.right_field);
        let has_left = joined.contains(pair.left_table.as_str());
        let has_right = joined.contains(pair.right_table.as_str());
        acc = match (has_left, has_right) {
            (true, true) => acc
                .into_iter()
                .filter(|row| row.get(&left_key).is_some_and(|v| row.get(&right_key) == Some(v)))
                .collect(),
            (true, false) => {
                let other = per_table.remove(&pair.right_table).unwrap_or_default();
                joined.insert(pair.right_table.as_str());
                nested_loop(acc, &other, &left_key, &right_key)
            }
            (false, true) => {
                let other = per_table.remove(&pair.left_table).unwrap_or_default();
                joined.insert(pair.left_table.as_str());
                nested_loop(acc, &other, &right_key, &left_key)
            }
            (false, false) => {
                return Err(KvRelError::InvalidJoin(format!(
                    "pair {} = {} is not connected to the tables joined before it",
                    left_key, right_key
                )));
            }
        };
    }
    debug!(tables = ?tables, rows = acc.len(), "join evaluated");
    Ok(acc.into_iter().map(|row| projection.apply(row)).collect())
}

fn nested_loop(left: Vec<Row>, right: &[Row], left_key: &str, right_key: &str) -> Vec<Row> {
    let mut out = Vec::new();
    for l in &left {
        let Some(lv) = l.get(left_key) else {
            continue;
        };
        for r in right {
            if r.get(right_key) == Some(lv) {
                out.push(l.merged(r));
            }
        }
    }
    out
}

fn validate_join(tables: &[String], using: &UsingJoin) -> Result<(), KvRelError> {
    if tables.len() < 2 {
        return Err(KvRelError::InvalidJoin(
            "a join needs at least two tables".into(),
        ));
    }
    let distinct: BTreeSet<&String> = tables.iter().collect();
    if distinct.len() != tables.len() {
        return Err(KvRelError::InvalidJoin("a table is listed twice".into()));
    }
    for pair in &using.on {
        for table in [&pair.left_table, &pair.right_table] {
            if !tables.contains(table) {
                return Err(KvRelError::InvalidJoin(format!(
                    "join pair names unlisted table '{table}'"
                )));
            }
        }
    }
    if let Some(table) = tables.iter().find(|t| !using.mentions(t)) {
        return Err(KvRelError::InvalidJoin(format!(
            "table '{table}' is not mentioned by any join pair"
        )));
    }
    if let Some(table) = using.predicates.keys().find(|t| !tables.contains(t)) {
        return Err(KvRelError::InvalidJoin(format!(
            "filter given for unlisted table '{table}'"
        )));
    }
    Ok(())
}

pub async fn execute_query<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    query: &Query,
) -> Result<Vec<Row>, KvRelError> {
    match (query.tables.as_slice(), &query.using) {
        ([table], None) => select(tx, &query.projection, table, query.predicate.as_ref()).await,
        ([], _) => Err(KvRelError::InvalidJoin("query names no table".into())),
        (tables, Some(using)) => {
            let mut using = using.clone();
            if let Some(predicate) = &query.predicate {
                using.predicates.insert(tables[0].clone(), predicate.clone());
            }
            select_join(tx, &query.projection, tables, &using).await
        }
        (_, None) => Err(KvRelError::InvalidJoin(
            "joining several tables needs join pairs".into(),
        )),
    }
}
