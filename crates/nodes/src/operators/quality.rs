//! `QualityCheck`: run scalar probes and compare against expected values.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::ProbeMismatch;
use crate::warehouse::Warehouse;
use crate::{ActionError, ConfigError, RunContext, TaskAction};

/// One probe: a query returning a single number and the value it must equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityProbe {
    pub sql: String,
    #[serde(default)]
    pub expect: i64,
}

impl QualityProbe {
    pub fn new(sql: impl Into<String>, expect: i64) -> Self {
        Self {
            sql: sql.into(),
            expect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheckConfig {
    /// Probes, run in order.
    pub checks: Vec<QualityProbe>,
}

impl QualityCheckConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checks.is_empty() {
            return Err(ConfigError::Invalid {
                operator: "quality_check",
                message: "at least one check is required".into(),
            });
        }
        if let Some(pos) = self.checks.iter().position(|c| c.sql.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                operator: "quality_check",
                message: format!("check #{} has no SQL expression", pos + 1),
            });
        }
        Ok(())
    }
}

/// Probe SQL is rendered against the run context before the first query, so
/// a missing parameter runs nothing.  Every probe runs even after a mismatch
/// so the failure lists them all.
/// Any mismatch fails the task; a probe whose query errors aborts the
/// remaining probes with that error.
pub struct QualityCheck {
    config: QualityCheckConfig,
    warehouse: Arc<dyn Warehouse>,
}

impl QualityCheck {
    pub fn new(config: QualityCheckConfig, warehouse: Arc<dyn Warehouse>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, warehouse })
    }
}

#[async_trait]
impl TaskAction for QualityCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<(), ActionError> {
        let rendered = self
            .config
            .checks
            .iter()
            .map(|probe| ctx.render(&probe.sql))
            .collect::<Result<Vec<_>, _>>()?;
        let mut mismatches = Vec::new();

        for (probe, sql) in self.config.checks.iter().zip(rendered) {
            let actual = self.warehouse.query_scalar(&sql).await?;
            if actual == probe.expect {
                info!("check passed: {sql} returns {actual}");
            } else {
                error!("check failed: {sql} returns {actual}, expected: {}", probe.expect);
                mismatches.push(ProbeMismatch {
                    sql,
                    expected: probe.expect,
                    actual,
                });
            }
        }

        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(ActionError::QualityCheck(mismatches))
        }
    }

    fn describe(&self) -> String {
        format!("quality_check({} probes)", self.config.checks.len())
    }

    fn templates(&self) -> Vec<&str> {
        self.config.checks.iter().map(|c| c.sql.as_str()).collect()
    }
}
