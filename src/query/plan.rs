use crate::catalog::types::{Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Clause {
    /// Matches when the field equals any of the listed values.
    Equals { field: String, one_of: Vec<Value> },
}

impl Clause {
    pub fn field(&self) -> &str {
        match self {
            Clause::Equals { field, .. } => field,
        }
    }

    pub fn values(&self) -> &[Value] {
        match self {
            Clause::Equals { one_of, .. } => one_of,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Clause::Equals { field, one_of } => row.get(field).is_some_and(|v| one_of.contains(v)),
        }
    }
}

/// Conjunction of clauses; the empty predicate matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub clauses: Vec<Clause>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(self, field: &str, value: impl Into<Value>) -> Self {
        self.one_of(field, [value])
    }

    pub fn one_of<V: Into<Value>>(mut self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.clauses.push(Clause::Equals {
            field: field.to_string(),
            one_of: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Distinct constrained fields, in clause order.
    pub fn fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for clause in &self.clauses {
            if !out.iter().any(|f| f == clause.field()) {
                out.push(clause.field().to_string());
            }
        }
        out
    }

    /// Candidate values of the first clause on `field`.
    pub fn values_for(&self, field: &str) -> Option<&[Value]> {
        self.clauses
            .iter()
            .find(|c| c.field() == field)
            .map(Clause::values)
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.clauses.iter().all(|c| c.matches(row))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    All,
    Fields(Vec<String>),
}

impl Projection {
    pub fn fields(fields: &[&str]) -> Self {
        if fields.contains(&WILDCARD) {
            Projection::All
        } else {
            Projection::Fields(fields.iter().map(|s| s.to_string()).collect())
        }
    }

    pub fn apply(&self, row: Row) -> Row {
        match self {
            Projection::All => row,
            Projection::Fields(fields) => row.project(fields),
        }
    }
}

/// `left_table.left_field = right_table.right_field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOn {
    pub left_table: String,
    pub left_field: String,
    pub right_table: String,
    pub right_field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsingJoin {
    pub on: Vec<JoinOn>,
    /// Filters applied to each table before joining, keyed by table name.
    pub predicates: BTreeMap<String, Predicate>,
}

impl UsingJoin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, left_table: &str, left_field: &str, right_table: &str, right_field: &str) -> Self {
        self.on.push(JoinOn {
            left_table: left_table.to_string(),
            left_field: left_field.to_string(),
            right_table: right_table.to_string(),
            right_field: right_field.to_string(),
        });
        self
    }

    pub fn filter(mut self, table: &str, predicate: Predicate) -> Self {
        self.predicates.insert(table.to_string(), predicate);
        self
    }

    pub fn mentions(&self, table: &str) -> bool {
        self.on
            .iter()
            .any(|pair| pair.left_table == table || pair.right_table == table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStrategy {
    UniqueIndex { index: String, field: String },
    Index { index: String, field: String },
    /// Direct primary-key lookup.
    Fast { pk_field: String },
    Sequential,
}

impl ScanStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ScanStrategy::UniqueIndex { .. } => "unique_index",
            ScanStrategy::Index { .. } => "index",
            ScanStrategy::Fast { .. } => "fast",
            ScanStrategy::Sequential => "sequential",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub projection: Projection,
    pub tables: Vec<String>,
    pub predicate: Option<Predicate>,
    pub using: Option<UsingJoin>,
}

impl Query {
    pub fn select(fields: &[&str]) -> Self {
        Self {
            projection: Projection::fields(fields),
            tables: Vec::new(),
            predicate: None,
            using: None,
        }
    }

    pub fn from(mut self, table: &str) -> Self {
        self.tables = vec![table.to_string()];
        self
    }

    pub fn join(mut self, table: &str) -> Self {
        self.tables.push(table.to_string());
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn using(mut self, using: UsingJoin) -> Self {
        self.using = Some(using);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Predicate, Projection, Query, UsingJoin};
    use crate::catalog::types::{Row, Value};

    #[test]
    fn predicate_is_a_conjunction_of_alternatives() {
        let p = Predicate::new()
            .one_of("fieldA", ["x", "y"])
            .equals("fieldB", 1_i64);
        assert!(p.matches(&Row::new().with("fieldA", "y").with("fieldB", 1_i64)));
        assert!(!p.matches(&Row::new().with("fieldA", "z").with("fieldB", 1_i64)));
        assert!(!p.matches(&Row::new().with("fieldA", "x")));
        assert_eq!(p.fields(), vec!["fieldA".to_string(), "fieldB".to_string()]);
        assert_eq!(p.values_for("fieldB"), Some(&[Value::Integer(1)][..]));
        assert!(Predicate::new().matches(&Row::new()));
    }

    #[test]
    fn wildcard_selects_everything() {
        assert_eq!(Projection::fields(&["*"]), Projection::All);
        let row = Row::new().with("a", 1_i64).with("b", 2_i64);
        assert_eq!(Projection::fields(&["b"]).apply(row).field_names(), vec!["b".to_string()]);
    }

    #[test]
    fn builder_collects_tables() {
        let q = Query::select(&["*"])
            .from("B")
            .join("A")
            .using(UsingJoin::new().on("B", "ref", "A", "idA"));
        assert_eq!(q.tables, vec!["B".to_string(), "A".to_string()]);
        assert!(q.using.as_ref().is_some_and(|u| u.mentions("A")));
    }
}
