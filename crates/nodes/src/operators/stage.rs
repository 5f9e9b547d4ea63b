//! `StageData`: clear a staging table and bulk-copy raw files into it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::warehouse::{CredentialProvider, Warehouse};
use crate::{ActionError, ConfigError, RunContext, TaskAction};

fn default_bucket() -> String {
    "udacity-dend".to_owned()
}

fn default_region() -> String {
    "us-west-2".to_owned()
}

/// Options recognised by [`StageData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDataConfig {
    /// Staging table that is cleared and then loaded.
    pub table: String,
    #[serde(default = "default_bucket")]
    pub s3_bucket: String,
    /// Key (prefix) inside the bucket; may reference run-context parameters.
    pub s3_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Verbatim `FORMAT AS` clause, e.g. `JSON 'auto'`.
    pub file_format: String,
}

impl StageDataConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("table", &self.table),
            ("s3_bucket", &self.s3_bucket),
            ("s3_key", &self.s3_key),
            ("region", &self.region),
            ("file_format", &self.file_format),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    operator: "stage_data",
                    field,
                });
            }
        }
        Ok(())
    }
}

/// Staging load.
///
/// Destructive: the destination is emptied with `DELETE FROM` before every
/// copy, which is what makes a retried attempt safe to run again.
pub struct StageData {
    config: StageDataConfig,
    warehouse: Arc<dyn Warehouse>,
    credentials: Arc<dyn CredentialProvider>,
}

impl StageData {
    pub fn new(
        config: StageDataConfig,
        warehouse: Arc<dyn Warehouse>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            warehouse,
            credentials,
        })
    }

    pub fn config(&self) -> &StageDataConfig {
        &self.config
    }

    /// Fully-qualified source location for this run.
    pub fn source_path(&self, ctx: &RunContext) -> Result<String, ActionError> {
        let key = ctx.render(&self.config.s3_key)?;
        Ok(format!("s3://{}/{}", self.config.s3_bucket, key))
    }
}

#[async_trait]
impl TaskAction for StageData {
    async fn execute(&self, ctx: &RunContext) -> Result<(), ActionError> {
        let source = self.source_path(ctx)?;
        let creds = self.credentials.credentials().await?;
        let table = &self.config.table;

        info!("clearing staging table {table}");
        self.warehouse.run(&format!("DELETE FROM {table}")).await?;

        info!("copying {source} into {table}");
        let copy = format!(
            "COPY {table}\n\
             FROM '{source}'\n\
             ACCESS_KEY_ID '{}'\n\
             SECRET_ACCESS_KEY '{}'\n\
             FORMAT AS {}\n\
             REGION '{}'\n\
             TIMEFORMAT AS 'epochmillisecs'",
            creds.access_key, creds.secret_key, self.config.file_format, self.config.region,
        );
        self.warehouse.run(&copy).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("stage_data({})", self.config.table)
    }

    fn templates(&self) -> Vec<&str> {
        vec![self.config.s3_key.as_str()]
    }
}
