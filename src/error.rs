use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvRelErrorCode {
    InvalidKey,
    NoSuchTable,
    InvalidSchema,
    InvalidQueryFields,
    InvalidPredicateFields,
    InvalidField,
    InvalidJoin,
    SchemaConflict,
    ForeignKeyViolation,
    UniquenessViolation,
    PreconditionFailed,
    OutOfRange,
    PrimaryKeyImmutable,
    MissingKey,
    TransactionAborted,
    Timeout,
    InvalidConfig,
    Encode,
    Decode,
    Backend,
}

impl KvRelErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            KvRelErrorCode::InvalidKey => "invalid_key",
            KvRelErrorCode::NoSuchTable => "no_such_table",
            KvRelErrorCode::InvalidSchema => "invalid_schema",
            KvRelErrorCode::InvalidQueryFields => "invalid_query_fields",
            KvRelErrorCode::InvalidPredicateFields => "invalid_predicate_fields",
            KvRelErrorCode::InvalidField => "invalid_field",
            KvRelErrorCode::InvalidJoin => "invalid_join",
            KvRelErrorCode::SchemaConflict => "schema_conflict",
            KvRelErrorCode::ForeignKeyViolation => "foreign_key_violation",
            KvRelErrorCode::UniquenessViolation => "uniqueness_violation",
            KvRelErrorCode::PreconditionFailed => "precondition_failed",
            KvRelErrorCode::OutOfRange => "out_of_range",
            KvRelErrorCode::PrimaryKeyImmutable => "primary_key_immutable",
            KvRelErrorCode::MissingKey => "missing_key",
            KvRelErrorCode::TransactionAborted => "transaction_aborted",
            KvRelErrorCode::Timeout => "timeout",
            KvRelErrorCode::InvalidConfig => "invalid_config",
            KvRelErrorCode::Encode => "encode",
            KvRelErrorCode::Decode => "decode",
            KvRelErrorCode::Backend => "backend",
        }
    }
}

#[derive(Debug, Error)]
pub enum KvRelError {
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("table '{table}' does not exist")]
    NoSuchTable { table: String },
    #[error("invalid schema for table '{table}': {reason}")]
    InvalidSchema { table: String, reason: String },
    #[error("invalid query fields {fields:?} on table '{table}'")]
    InvalidQueryFields { table: String, fields: Vec<String> },
    #[error("invalid predicate fields {fields:?} on table '{table}'")]
    InvalidPredicateFields { table: String, fields: Vec<String> },
    #[error("field '{field}' is not part of table '{table}'")]
    InvalidField { table: String, field: String },
    #[error("invalid join: {0}")]
    InvalidJoin(String),
    #[error("'{name}' already exists in '{table}'")]
    SchemaConflict { table: String, name: String },
    #[error("foreign key violation on {table}.{alias} -> {reference_table}.{field_name}: {reason}")]
    ForeignKeyViolation {
        table: String,
        alias: String,
        reference_table: String,
        field_name: String,
        reason: String,
    },
    #[error("uniqueness violation on index '{index}' in table '{table}'")]
    UniquenessViolation { table: String, index: String },
    #[error("precondition failed on key {key:?}")]
    PreconditionFailed { key: String },
    #[error("primary key {requested} out of range on table '{table}' (current={current})")]
    OutOfRange {
        table: String,
        requested: u64,
        current: u64,
    },
    #[error("primary key field '{field}' of table '{table}' cannot be updated")]
    PrimaryKeyImmutable { table: String, field: String },
    #[error("missing key {key:?}")]
    MissingKey { key: String },
    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: String },
    #[error("backend request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl KvRelError {
    pub fn code(&self) -> KvRelErrorCode {
        match self {
            KvRelError::InvalidKey { .. } => KvRelErrorCode::InvalidKey,
            KvRelError::NoSuchTable { .. } => KvRelErrorCode::NoSuchTable,
            KvRelError::InvalidSchema { .. } => KvRelErrorCode::InvalidSchema,
            KvRelError::InvalidQueryFields { .. } => KvRelErrorCode::InvalidQueryFields,
            KvRelError::InvalidPredicateFields { .. } => KvRelErrorCode::InvalidPredicateFields,
            KvRelError::InvalidField { .. } => KvRelErrorCode::InvalidField,
            KvRelError::InvalidJoin(_) => KvRelErrorCode::InvalidJoin,
            KvRelError::SchemaConflict { .. } => KvRelErrorCode::SchemaConflict,
            KvRelError::ForeignKeyViolation { .. } => KvRelErrorCode::ForeignKeyViolation,
            KvRelError::UniquenessViolation { .. } => KvRelErrorCode::UniquenessViolation,
            KvRelError::PreconditionFailed { .. } => KvRelErrorCode::PreconditionFailed,
            KvRelError::OutOfRange { .. } => KvRelErrorCode::OutOfRange,
            KvRelError::PrimaryKeyImmutable { .. } => KvRelErrorCode::PrimaryKeyImmutable,
            KvRelError::MissingKey { .. } => KvRelErrorCode::MissingKey,
            KvRelError::TransactionAborted { .. } => KvRelErrorCode::TransactionAborted,
            KvRelError::Timeout { .. } => KvRelErrorCode::Timeout,
            KvRelError::InvalidConfig { .. } => KvRelErrorCode::InvalidConfig,
            KvRelError::Encode(_) => KvRelErrorCode::Encode,
            KvRelError::Decode(_) => KvRelErrorCode::Decode,
            KvRelError::Backend(_) => KvRelErrorCode::Backend,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Query-side schema failures (unknown projection or predicate fields)
    /// belong to the same family as insert schema failures.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            KvRelError::InvalidSchema { .. }
                | KvRelError::InvalidQueryFields { .. }
                | KvRelError::InvalidPredicateFields { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for KvRelError {
    fn from(value: rmp_serde::encode::Error) -> Self {
        KvRelError::Encode(value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for KvRelError {
    fn from(value: rmp_serde::decode::Error) -> Self {
        KvRelError::Decode(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{KvRelError, KvRelErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(KvRelErrorCode::NoSuchTable.as_str(), "no_such_table");
        assert_eq!(
            KvRelErrorCode::ForeignKeyViolation.as_str(),
            "foreign_key_violation"
        );
        assert_eq!(
            KvRelErrorCode::PrimaryKeyImmutable.as_str(),
            "primary_key_immutable"
        );
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = KvRelError::UniquenessViolation {
            table: "users".into(),
            index: "by_email".into(),
        };
        assert_eq!(err.code(), KvRelErrorCode::UniquenessViolation);
        assert_eq!(err.code_str(), "uniqueness_violation");
        assert_eq!(
            err.to_string(),
            "uniqueness violation on index 'by_email' in table 'users'"
        );
    }

    #[test]
    fn query_field_errors_are_schema_errors() {
        let err = KvRelError::InvalidQueryFields {
            table: "t".into(),
            fields: vec!["nope".into()],
        };
        assert!(err.is_schema_error());
        assert!(
            !KvRelError::MissingKey {
                key: "t/PK/1".into()
            }
            .is_schema_error()
        );
    }
}
