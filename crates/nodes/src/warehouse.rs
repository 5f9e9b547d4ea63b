//! Collaborator interfaces for the destination warehouse and object-store
//! credentials, plus the in-memory implementations used by tests and dry
//! runs.
//!
//! The operators never see a wire protocol: they hand SQL text to a
//! [`Warehouse`] and read back a scalar when they need one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::WarehouseError;

/// Destination system that executes statements.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Execute a statement, discarding any result set.
    async fn run(&self, sql: &str) -> Result<(), WarehouseError>;

    /// Execute a query and return the first column of the first row.
    async fn query_scalar(&self, sql: &str) -> Result<i64, WarehouseError>;
}

/// Access keys for the object store a stage operator copies from.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self) -> Result<Credentials, WarehouseError>;
}

/// Fixed credentials, handy for tests.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

impl StaticCredentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self(Credentials {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        })
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials, WarehouseError> {
        Ok(self.0.clone())
    }
}

/// Reads `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` on every call.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn credentials(&self) -> Result<Credentials, WarehouseError> {
        let read = |key: &str| {
            std::env::var(key)
                .map_err(|_| WarehouseError::fatal(format!("environment variable {key} is not set")))
        };
        Ok(Credentials {
            access_key: read("AWS_ACCESS_KEY_ID")?,
            secret_key: read("AWS_SECRET_ACCESS_KEY")?,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingWarehouse
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Recorded {
    statements: Vec<String>,
    scalars: HashMap<String, i64>,
    failures: Vec<(String, VecDeque<WarehouseError>)>,
    sticky_failures: Vec<(String, WarehouseError)>,
}

/// In-memory warehouse that records every statement it receives.
///
/// Scalar queries answer from a scripted table (default `0`).  Failures can
/// be scripted by substring match, either a fixed number of times or on
/// every call.
#[derive(Clone, Default)]
pub struct RecordingWarehouse {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `value` whenever exactly `sql` is queried.
    pub fn with_scalar(self, sql: impl Into<String>, value: i64) -> Self {
        self.lock().scalars.insert(sql.into(), value);
        self
    }

    /// Fail the next call whose SQL contains `needle` with `error`.
    /// Calling this repeatedly queues several failures.
    pub fn fail_once(self, needle: impl Into<String>, error: WarehouseError) -> Self {
        let needle = needle.into();
        {
            let mut inner = self.lock();
            match inner.failures.iter_mut().find(|(n, _)| *n == needle) {
                Some((_, queue)) => queue.push_back(error),
                None => inner.failures.push((needle, VecDeque::from([error]))),
            }
        }
        self
    }

    /// Fail every call whose SQL contains `needle`.
    pub fn fail_always(self, needle: impl Into<String>, error: WarehouseError) -> Self {
        self.lock().sticky_failures.push((needle.into(), error));
        self
    }

    /// Every statement seen so far, in call order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        // A poisoned lock only means another test thread panicked mid-push.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, sql: &str) -> Result<(), WarehouseError> {
        let mut inner = self.lock();
        inner.statements.push(sql.to_owned());
        debug!(sql = %compact(sql), "warehouse statement");

        if let Some((_, err)) = inner.sticky_failures.iter().find(|(n, _)| sql.contains(n.as_str())) {
            return Err(err.clone());
        }
        for (needle, queue) in inner.failures.iter_mut() {
            if sql.contains(needle.as_str()) {
                if let Some(err) = queue.pop_front() {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Warehouse for RecordingWarehouse {
    async fn run(&self, sql: &str) -> Result<(), WarehouseError> {
        self.record(sql)
    }

    async fn query_scalar(&self, sql: &str) -> Result<i64, WarehouseError> {
        self.record(sql)?;
        Ok(self.lock().scalars.get(sql).copied().unwrap_or(0))
    }
}

fn compact(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
