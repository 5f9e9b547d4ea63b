//! Fact and dimension loads.
//!
//! Both insert the rows selected by a query into a destination table.  A
//! fact load only ever appends; a dimension load replaces the table
//! contents unless `truncate` is turned off.
//!
//! The query is rendered against the run context first, so it may refer to
//! run parameters such as `{ds}`; write literal braces as `{{` and `}}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::warehouse::Warehouse;
use crate::{ActionError, ConfigError, RunContext, TaskAction};

fn insert_statement(table: &str, query: &str) -> String {
    format!("INSERT INTO {table} ({})", query.trim())
}

fn require(operator: &'static str, field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField { operator, field });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// LoadFact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFactConfig {
    pub table: String,
    /// SELECT producing the rows to append.
    pub sql_query: String,
}

impl LoadFactConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require("load_fact", "table", &self.table)?;
        require("load_fact", "sql_query", &self.sql_query)
    }
}

pub struct LoadFact {
    config: LoadFactConfig,
    warehouse: Arc<dyn Warehouse>,
}

impl LoadFact {
    pub fn new(config: LoadFactConfig, warehouse: Arc<dyn Warehouse>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, warehouse })
    }
}

#[async_trait]
impl TaskAction for LoadFact {
    async fn execute(&self, ctx: &RunContext) -> Result<(), ActionError> {
        let query = ctx.render(&self.config.sql_query)?;
        info!("appending into fact table {}", self.config.table);
        self.warehouse
            .run(&insert_statement(&self.config.table, &query))
            .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("load_fact({})", self.config.table)
    }

    fn templates(&self) -> Vec<&str> {
        vec![self.config.sql_query.as_str()]
    }
}

// ---------------------------------------------------------------------------
// LoadDimension
// ---------------------------------------------------------------------------

fn default_truncate() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadDimensionConfig {
    pub table: String,
    pub sql_query: String,
    /// Empty the table before inserting.
    #[serde(default = "default_truncate")]
    pub truncate: bool,
}

impl LoadDimensionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require("load_dimension", "table", &self.table)?;
        require("load_dimension", "sql_query", &self.sql_query)
    }
}

pub struct LoadDimension {
    config: LoadDimensionConfig,
    warehouse: Arc<dyn Warehouse>,
}

impl LoadDimension {
    pub fn new(
        config: LoadDimensionConfig,
        warehouse: Arc<dyn Warehouse>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, warehouse })
    }
}

#[async_trait]
impl TaskAction for LoadDimension {
    async fn execute(&self, ctx: &RunContext) -> Result<(), ActionError> {
        let query = ctx.render(&self.config.sql_query)?;
        let table = &self.config.table;
        if self.config.truncate {
            info!("truncating dimension table {table}");
            self.warehouse.run(&format!("TRUNCATE TABLE {table}")).await?;
        }
        info!("loading dimension table {table}");
        self.warehouse
            .run(&insert_statement(table, &query))
            .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("load_dimension({})", self.config.table)
    }

    fn templates(&self) -> Vec<&str> {
        vec![self.config.sql_query.as_str()]
    }
}
