//! Per-run context handed to every action.
//!
//! A [`RunContext`] is built once when a run starts and is read-only from
//! then on.  Besides the caller-supplied parameters it exposes a handful of
//! values derived from the logical timestamp so that templated inputs such
//! as `log-data/{execution_date.year}/{execution_date.month:02}` resolve to
//! a partition path.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::TemplateError;

const RUN_ID: &str = "run_id";

/// Immutable record of a single run's inputs.
///
/// Cloning is cheap; the parameter map is shared.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Uuid,
    logical_timestamp: DateTime<Utc>,
    parameters: Arc<BTreeMap<String, String>>,
}

impl RunContext {
    /// Create a context with a fresh run id.
    pub fn new(logical_timestamp: DateTime<Utc>, parameters: BTreeMap<String, String>) -> Self {
        Self::with_run_id(Uuid::new_v4(), logical_timestamp, parameters)
    }

    pub fn with_run_id(
        run_id: Uuid,
        logical_timestamp: DateTime<Utc>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        let mut resolved = builtin_parameters(run_id, logical_timestamp);
        // Caller-supplied values win over the derived ones, except the run
        // id, which must match the one reported for the run.
        for (name, value) in parameters {
            if name == RUN_ID {
                warn!(ignored = %value, "parameter `run_id` cannot be overridden");
                continue;
            }
            resolved.insert(name, value);
        }

        Self {
            run_id,
            logical_timestamp,
            parameters: Arc::new(resolved),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn logical_timestamp(&self) -> DateTime<Utc> {
        self.logical_timestamp
    }

    /// Look up a parameter (built-in or caller-supplied).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Substitute `{name}` / `{name:02}` placeholders in `template`.
    ///
    /// `{{` and `}}` produce literal braces.  An unknown name is an error
    /// rather than being left in place.
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '}' => {
                    return Err(TemplateError::UnmatchedClose {
                        template: template.to_owned(),
                    });
                }
                '{' => {
                    let mut placeholder = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        placeholder.push(inner);
                    }
                    if !closed {
                        return Err(TemplateError::Unterminated {
                            template: template.to_owned(),
                        });
                    }
                    out.push_str(&self.resolve_placeholder(template, &placeholder)?);
                }
                other => out.push(other),
            }
        }

        Ok(out)
    }

    fn resolve_placeholder(&self, template: &str, placeholder: &str) -> Result<String, TemplateError> {
        let (name, spec) = match placeholder.split_once(':') {
            Some((name, spec)) => (name.trim(), Some(spec.trim())),
            None => (placeholder.trim(), None),
        };

        let value = self
            .parameter(name)
            .ok_or_else(|| TemplateError::MissingParameter {
                template: template.to_owned(),
                name: name.to_owned(),
            })?;

        match spec {
            None | Some("") => Ok(value.to_owned()),
            Some(spec) => apply_format(template, spec, value),
        }
    }
}

/// Only zero-padded widths (`02`, `04`, ...) are understood.
fn apply_format(template: &str, spec: &str, value: &str) -> Result<String, TemplateError> {
    let bad_format = || TemplateError::BadFormat {
        template: template.to_owned(),
        spec: spec.to_owned(),
        value: value.to_owned(),
    };

    let width = spec
        .strip_prefix('0')
        .and_then(|w| w.strip_suffix('d').or(Some(w)))
        .and_then(|w| w.parse::<usize>().ok())
        .ok_or_else(bad_format)?;
    let number: i64 = value.parse().map_err(|_| bad_format())?;

    Ok(format!("{number:0width$}"))
}

fn builtin_parameters(run_id: Uuid, ts: DateTime<Utc>) -> BTreeMap<String, String> {
    [
        (RUN_ID, run_id.to_string()),
        ("ds", ts.format("%Y-%m-%d").to_string()),
        ("ds_nodash", ts.format("%Y%m%d").to_string()),
        ("ts", ts.to_rfc3339()),
        ("execution_date.year", ts.year().to_string()),
        ("execution_date.month", ts.month().to_string()),
        ("execution_date.day", ts.day().to_string()),
        ("execution_date.hour", ts.hour().to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v))
    .collect()
}
