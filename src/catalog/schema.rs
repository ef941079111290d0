use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDef {
    pub index_name: String,
    pub field_names: Vec<String>,
}

impl IndexDef {
    pub fn new<S: Into<String>>(
        index_name: impl Into<String>,
        field_names: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            index_name: index_name.into(),
            field_names: field_names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn covers(&self, field: &str) -> bool {
        self.field_names.iter().any(|f| f == field)
    }

    /// True when every field of the index appears in `fields`.
    pub fn contained_in(&self, fields: &[String]) -> bool {
        self.field_names.iter().all(|f| fields.contains(f))
    }
}

/// Directed edge `child.alias -> reference_table.field_name`.
///
/// On the parent side the same shape is mirrored into
/// `incoming_foreign_keys`, with `reference_table` naming the child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKey {
    pub alias: String,
    pub field_name: String,
    pub reference_table: String,
}

/// Caller-facing foreign key definition; `alias` defaults to `field_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDef {
    pub alias: Option<String>,
    pub field_name: String,
    pub reference_table: String,
}

impl ForeignKeyDef {
    pub fn new(field_name: impl Into<String>, reference_table: impl Into<String>) -> Self {
        Self {
            alias: None,
            field_name: field_name.into(),
            reference_table: reference_table.into(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn resolve(self) -> ForeignKey {
        ForeignKey {
            alias: self.alias.unwrap_or_else(|| self.field_name.clone()),
            field_name: self.field_name,
            reference_table: self.reference_table,
        }
    }
}

/// Everything the catalog knows about one table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableMetadata {
    pub name: String,
    pub schema: Vec<String>,
    pub primary_key_field: String,
    pub current_pk_value: u64,
    #[serde(default)]
    pub indices: Vec<IndexDef>,
    #[serde(default)]
    pub unique_indices: Vec<IndexDef>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub incoming_foreign_keys: Vec<ForeignKey>,
}

impl TableMetadata {
    pub fn new(name: impl Into<String>, schema: Vec<String>) -> Self {
        let primary_key_field = schema.first().cloned().unwrap_or_default();
        Self {
            name: name.into(),
            schema,
            primary_key_field,
            current_pk_value: 0,
            indices: Vec::new(),
            unique_indices: Vec::new(),
            foreign_keys: Vec::new(),
            incoming_foreign_keys: Vec::new(),
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.schema.iter().any(|f| f == field)
    }

    /// Index names share one namespace across regular and unique indices.
    pub fn has_index_named(&self, index_name: &str) -> bool {
        self.indices
            .iter()
            .chain(self.unique_indices.iter())
            .any(|idx| idx.index_name == index_name)
    }

    pub fn non_key_fields(&self) -> impl Iterator<Item = &String> {
        self.schema
            .iter()
            .filter(move |f| **f != self.primary_key_field)
    }
}
