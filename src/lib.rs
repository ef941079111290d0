//! Relational tables, secondary indices and foreign keys on top of a
//! transactional register/counter/map store.
//!
//! Every public operation on [`Database`] runs inside one backend
//! transaction. Compose several operations atomically with
//! [`Database::run_transaction`] and the free functions of the `catalog`,
//! `commit` and `query` modules, which all take the open [`Transaction`].

pub mod catalog;
pub mod commit;
pub mod config;
pub mod error;
pub mod query;
pub mod storage;

use crate::catalog::schema::{ForeignKey, ForeignKeyDef, IndexDef, TableMetadata};
use crate::catalog::types::Row;
use crate::commit::update::Assignments;
use crate::config::StoreConfig;
use crate::error::KvRelError;
use crate::query::plan::{Predicate, Projection, Query, UsingJoin};
use crate::storage::backend::Backend;
use crate::storage::memory::MemoryBackend;
use tracing::{info, warn};

pub use crate::storage::tx::Transaction;

#[derive(Debug, Clone)]
pub struct Database<B: Backend> {
    config: StoreConfig,
    backend: B,
}

impl Database<MemoryBackend> {
    /// Database over a fresh in-process backend.
    pub fn in_memory(config: StoreConfig) -> Result<Self, KvRelError> {
        Self::open(config, MemoryBackend::new())
    }
}

impl<B: Backend> Database<B> {
    pub fn open(config: StoreConfig, backend: B) -> Result<Self, KvRelError> {
        config.validate()?;
        info!(
            endpoint = %config.endpoint,
            bucket = %config.bucket,
            request_timeout_ms = config.request_timeout_ms,
            "database opened"
        );
        Ok(Self { config, backend })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Opens a transaction the caller must commit or abort.
    pub async fn begin(&self) -> Result<Transaction<B::Transaction>, KvRelError> {
        Transaction::begin(
            &self.backend,
            &self.config.bucket,
            self.config.request_timeout(),
        )
        .await
    }

    /// Runs `f` in a fresh transaction: commits when it returns `Ok`, aborts
    /// and hands back the error unchanged otherwise.
    pub async fn run_transaction<R>(
        &self,
        f: impl AsyncFnOnce(&mut Transaction<B::Transaction>) -> Result<R, KvRelError>,
    ) -> Result<R, KvRelError> {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let id = tx.id();
                warn!(tx = id, error = %err, code = err.code_str(), "transaction aborted");
                if let Err(abort_err) = tx.abort().await {
                    warn!(tx = id, error = %abort_err, "abort failed");
                }
                Err(err)
            }
        }
    }

    pub async fn create_table(&self, name: &str, schema: &[&str]) -> Result<TableMetadata, KvRelError> {
        let schema = owned(schema);
        self.run_transaction(async |tx| catalog::create_table(tx, name, &schema).await)
            .await
    }

    pub async fn create_index(
        &self,
        table: &str,
        index_name: &str,
        field_names: &[&str],
    ) -> Result<IndexDef, KvRelError> {
        let fields = owned(field_names);
        self.run_transaction(async |tx| {
            storage::index::add_index(tx, table, index_name, &fields).await
        })
        .await
    }

    pub async fn create_unique_index(
        &self,
        table: &str,
        index_name: &str,
        field_names: &[&str],
    ) -> Result<IndexDef, KvRelError> {
        let fields = owned(field_names);
        self.run_transaction(async |tx| {
            storage::index::add_unique_index(tx, table, index_name, &fields).await
        })
        .await
    }

    pub async fn create_foreign_key(
        &self,
        table: &str,
        def: ForeignKeyDef,
    ) -> Result<ForeignKey, KvRelError> {
        self.run_transaction(async |tx| commit::constraints::create_foreign_key(tx, table, def).await)
            .await
    }

    /// Returns the primary key allocated to the row.
    pub async fn insert(&self, table: &str, row: Row) -> Result<u64, KvRelError> {
        self.run_transaction(async |tx| commit::insert::insert(tx, table, row).await)
            .await
    }

    pub async fn select(
        &self,
        fields: &[&str],
        table: &str,
        predicate: Option<Predicate>,
    ) -> Result<Vec<Row>, KvRelError> {
        let projection = Projection::fields(fields);
        self.run_transaction(async |tx| {
            query::executor::select(tx, &projection, table, predicate.as_ref()).await
        })
        .await
    }

    pub async fn select_join(
        &self,
        fields: &[&str],
        tables: &[&str],
        using: UsingJoin,
    ) -> Result<Vec<Row>, KvRelError> {
        let projection = Projection::fields(fields);
        let tables = owned(tables);
        self.run_transaction(async |tx| {
            query::executor::select_join(tx, &projection, &tables, &using).await
        })
        .await
    }

    pub async fn execute_query(&self, query: &Query) -> Result<Vec<Row>, KvRelError> {
        self.run_transaction(async |tx| query::executor::execute_query(tx, query).await)
            .await
    }

    /// Returns the number of rows updated.
    pub async fn update(
        &self,
        table: &str,
        assignments: Assignments,
        predicate: Option<Predicate>,
    ) -> Result<usize, KvRelError> {
        self.run_transaction(async |tx| {
            commit::update::update(tx, table, &assignments, predicate.as_ref()).await
        })
        .await
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, KvRelError> {
        self.run_transaction(async |tx| catalog::list_tables(tx).await)
            .await
    }

    pub async fn describe_table(&self, table: &str) -> Result<TableMetadata, KvRelError> {
        self.run_transaction(async |tx| catalog::describe_table(tx, table).await)
            .await
    }
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}
