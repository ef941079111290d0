use crate::catalog::describe_table;
use crate::catalog::types::{Row, Value};
use crate::commit::constraints::{check_incoming_fks, check_outgoing_fks};
use crate::error::KvRelError;
use crate::query::executor::select_rows;
use crate::query::plan::Predicate;
use crate::storage::backend::BackendTransaction;
use crate::storage::index::{
    prune_indices, prune_unique_indices, update_indices, update_unique_indices,
};
use crate::storage::key::KeyTerm;
use crate::storage::tx::Transaction;
use std::fmt;
use tracing::debug;

pub type UpdateFn = Box<dyn Fn(&Value) -> Value + Send + Sync>;

/// New value of one field: a constant, or computed from the old value.
pub enum Assignment {
    Set(Value),
    Apply(UpdateFn),
}

impl Assignment {
    pub fn evaluate(&self, old: &Value) -> Value {
        match self {
            Assignment::Set(value) => value.clone(),
            Assignment::Apply(f) => f(old),
        }
    }
}

impl fmt::Debug for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assignment::Set(value) => f.debug_tuple("Set").field(value).finish(),
            Assignment::Apply(_) => f.write_str("Apply(..)"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Assignments {
    entries: Vec<(String, Assignment)>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Assignment::Set(value.into()));
        self
    }

    pub fn apply(mut self, field: &str, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.push(field, Assignment::Apply(Box::new(f)));
        self
    }

    /// Later assignments to the same field replace earlier ones.
    fn push(&mut self, field: &str, assignment: Assignment) {
        self.entries.retain(|(f, _)| f != field);
        self.entries.push((field.to_string(), assignment));
    }

    pub fn fields(&self) -> Vec<String> {
        self.entries.iter().map(|(f, _)| f.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The updated fields only, evaluated against `old`.
    fn evaluate(&self, old: &Row) -> Row {
        let mut out = Row::new();
        for (field, assignment) in &self.entries {
            if let Some(value) = old.get(field) {
                out.insert(field.clone(), assignment.evaluate(value));
            }
        }
        out
    }
}

/// Rewrites the matching rows in place and returns how many were updated.
/// On error the handle is marked failed and will refuse to commit.
pub async fn update<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    assignments: &Assignments,
    predicate: Option<&Predicate>,
) -> Result<usize, KvRelError> {
    let result = update_rows(tx, table, assignments, predicate).await;
    tx.settle(result)
}

async fn update_rows<T: BackendTransaction>(
    tx: &mut Transaction<T>,
    table: &str,
    assignments: &Assignments,
    predicate: Option<&Predicate>,
) -> Result<usize, KvRelError> {
    let meta = describe_table(tx, table).await?;
    let fields = assignments.fields();
    if fields.contains(&meta.primary_key_field) {
        return Err(KvRelError::PrimaryKeyImmutable {
            table: table.to_string(),
            field: meta.primary_key_field.clone(),
        });
    }
    let unknown: Vec<&String> = fields.iter().filter(|f| !meta.has_field(f)).collect();
    if !unknown.is_empty() {
        return Err(KvRelError::InvalidSchema {
            table: table.to_string(),
            reason: format!("unknown fields {unknown:?}"),
        });
    }
    if assignments.is_empty() {
        return Ok(0);
    }

    let old_rows = select_rows(tx, &meta, predicate).await?;
    for (_, old) in &old_rows {
        check_incoming_fks(tx, table, old, &fields).await?;
    }
    let changes: Vec<Row> = old_rows
        .iter()
        .map(|(_, old)| assignments.evaluate(old))
        .collect();
    for change in &changes {
        check_outgoing_fks(tx, table, change).await?;
    }

    for ((pk, old), change) in old_rows.iter().zip(&changes) {
        let pk = *pk;
        let writes: Vec<(KeyTerm, Value)> = change
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
        tx.put(&writes).await?;
        prune_indices(tx, table, pk, old, &fields).await?;
        prune_unique_indices(tx, table, pk, old, &fields).await?;
        update_indices(tx, table, pk, change).await?;
        update_unique_indices(tx, table, pk, change).await?;
    }

    debug!(table = %table, rows = old_rows.len(), fields = ?fields, "rows updated");
    Ok(old_rows.len())
}
