//! Built-in task variants.
//!
//! [`OperatorConfig`] is the serialisable description of a variant; call
//! [`OperatorConfig::build`] with the collaborators to get a runnable
//! [`TaskAction`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::warehouse::{CredentialProvider, Warehouse};
use crate::{ActionError, ConfigError, RunContext, TaskAction};

pub mod load;
pub mod quality;
pub mod stage;

pub use load::{LoadDimension, LoadDimensionConfig, LoadFact, LoadFactConfig};
pub use quality::{QualityCheck, QualityCheckConfig, QualityProbe};
pub use stage::{StageData, StageDataConfig};

/// Marker task that does nothing, e.g. the start and end of a pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

#[async_trait]
impl TaskAction for NoOp {
    async fn execute(&self, _ctx: &RunContext) -> Result<(), ActionError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "no_op".to_owned()
    }
}

/// Tagged union of every operator's options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum OperatorConfig {
    StageData(StageDataConfig),
    LoadFact(LoadFactConfig),
    LoadDimension(LoadDimensionConfig),
    QualityCheck(QualityCheckConfig),
    NoOp,
}

/// External systems the operators talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub warehouse: Arc<dyn Warehouse>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            OperatorConfig::StageData(c) => c.validate(),
            OperatorConfig::LoadFact(c) => c.validate(),
            OperatorConfig::LoadDimension(c) => c.validate(),
            OperatorConfig::QualityCheck(c) => c.validate(),
            OperatorConfig::NoOp => Ok(()),
        }
    }

    pub fn build(&self, with: &Collaborators) -> Result<Arc<dyn TaskAction>, ConfigError> {
        let action: Arc<dyn TaskAction> = match self {
            OperatorConfig::StageData(c) => Arc::new(StageData::new(
                c.clone(),
                with.warehouse.clone(),
                with.credentials.clone(),
            )?),
            OperatorConfig::LoadFact(c) => Arc::new(LoadFact::new(c.clone(), with.warehouse.clone())?),
            OperatorConfig::LoadDimension(c) => {
                Arc::new(LoadDimension::new(c.clone(), with.warehouse.clone())?)
            }
            OperatorConfig::QualityCheck(c) => {
                Arc::new(QualityCheck::new(c.clone(), with.warehouse.clone())?)
            }
            OperatorConfig::NoOp => Arc::new(NoOp),
        };
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{RecordingWarehouse, StaticCredentials};

    #[test]
    fn operator_tag_selects_variant() {
        let cfg: OperatorConfig = serde_json::from_value(serde_json::json!({
            "operator": "load_dimension",
            "table": "artists",
            "sql_query": "SELECT 1",
            "truncate": false
        }))
        .unwrap();
        assert!(matches!(cfg, OperatorConfig::LoadDimension(ref c) if !c.truncate));

        let noop: OperatorConfig =
            serde_json::from_value(serde_json::json!({ "operator": "no_op" })).unwrap();
        assert_eq!(noop, OperatorConfig::NoOp);
    }

    #[test]
    fn build_validates_configuration() {
        let with = Collaborators {
            warehouse: Arc::new(RecordingWarehouse::new()),
            credentials: Arc::new(StaticCredentials::new("a", "b")),
        };
        let bad = OperatorConfig::LoadFact(LoadFactConfig {
            table: String::new(),
            sql_query: "SELECT 1".into(),
        });
        assert!(bad.build(&with).is_err());

        let action = OperatorConfig::NoOp.build(&with).unwrap();
        assert_eq!(action.describe(), "no_op");
    }
}
