//! Backflow propagation.
//!
//! After a run's results are stored, values from the results flow back into
//! the task's input contract, and from there one link at a time up the
//! contract chain. Each hop applies the `backflowMapping` of the transformer
//! that produced the child: every mapping computes a value from the child and
//! writes it at a path of the parent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use transformer_core::{BackflowMapping, Contract, FormulaOrValue, OutputManifest, TaskContract};

use crate::error::{BackflowError, StoreError};

/// Maximum number of upstream hops after the input contract.
pub const BACKFLOW_LIMIT: usize = 20;

/// The upstream side of a contract link.
#[derive(Debug, Clone)]
pub struct UpstreamLink {
    /// The contract the child was built from.
    pub parent: Contract,
    /// Backflow mapping of the transformer that built the child.
    pub mapping: Vec<BackflowMapping>,
}

/// Access to the contract store.
#[async_trait]
pub trait ContractStore: Send + Sync {
    /// The contract `contract` was built from, if any.
    async fn get_upstream_contract(
        &self,
        contract: &Contract,
    ) -> Result<Option<UpstreamLink>, StoreError>;

    /// Persist an updated contract.
    async fn update_contract(&self, contract: &Contract) -> Result<(), StoreError>;
}

/// Evaluates `$$formula` expressions.
pub trait FormulaEvaluator: Send + Sync {
    /// Evaluate `formula` against `context`; errors are plain messages.
    fn evaluate(&self, formula: &str, context: &Value) -> Result<Value, String>;
}

/// Evaluator that only understands dotted lookups such as
/// `contract.data.status`.
///
/// Numeric segments index into arrays. A path that leads nowhere yields null.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathFormulaEvaluator;

impl FormulaEvaluator for PathFormulaEvaluator {
    fn evaluate(&self, formula: &str, context: &Value) -> Result<Value, String> {
        let formula = formula.trim();
        let valid = !formula.is_empty()
            && formula
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '$'));
        if !valid {
            return Err(format!("unsupported expression '{}'", formula));
        }

        let mut current = context;
        for segment in formula.split('.') {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(Value::Null),
            }
        }
        Ok(current.clone())
    }
}

/// Outcome of a propagation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackflowReport {
    /// Results applied to the input contract.
    pub results_applied: usize,
    /// Upstream hops taken after the input contract.
    pub upstream_steps: usize,
    /// Propagation stopped at [`BACKFLOW_LIMIT`] rather than at the chain's end.
    pub limit_reached: bool,
}

/// Threads result values up the contract chain.
pub struct BackflowPropagator {
    store: Arc<dyn ContractStore>,
    evaluator: Arc<dyn FormulaEvaluator>,
}

impl BackflowPropagator {
    pub fn new(store: Arc<dyn ContractStore>, evaluator: Arc<dyn FormulaEvaluator>) -> Self {
        Self { store, evaluator }
    }

    /// Propagator using [`PathFormulaEvaluator`].
    pub fn with_path_evaluator(store: Arc<dyn ContractStore>) -> Self {
        Self::new(store, Arc::new(PathFormulaEvaluator))
    }

    /// Apply `manifest`'s results to the task's input, then walk upstream.
    ///
    /// Error results are skipped. A formula or store failure aborts
    /// propagation where it happens; updates already stored stay stored.
    pub async fn propagate(
        &self,
        task: &TaskContract,
        manifest: &OutputManifest,
    ) -> Result<BackflowReport, BackflowError> {
        info!(task = %task.slug, "Processing backflow");

        let mut report = BackflowReport::default();
        let mapping = &task.data.transformer.data.backflow_mapping;
        let mut current = task.data.input.to_untyped()?;

        for result in &manifest.results {
            if result.is_error() {
                debug!(result = %result.slug(), "Skipping backflow from error result");
                continue;
            }
            let child = result.to_contract()?;
            current = self.apply(&child, current, mapping)?;
            if !mapping.is_empty() {
                self.store.update_contract(&current).await?;
            }
            report.results_applied += 1;
        }

        loop {
            if report.upstream_steps == BACKFLOW_LIMIT {
                info!(
                    contract = %current.slug,
                    limit = BACKFLOW_LIMIT,
                    "Backflow propagation limit reached, not following further"
                );
                report.limit_reached = true;
                break;
            }

            let Some(link) = self.store.get_upstream_contract(&current).await? else {
                break;
            };

            let parent = self.apply(&current, link.parent, &link.mapping)?;
            if !link.mapping.is_empty() {
                self.store.update_contract(&parent).await?;
            }
            report.upstream_steps += 1;
            debug!(child = %current.slug, parent = %parent.slug, step = report.upstream_steps, "Backflow step");
            current = parent;
        }

        info!(
            results = report.results_applied,
            steps = report.upstream_steps,
            "Backflow done"
        );
        Ok(report)
    }

    /// Apply `mapping` in order, reading from `child` and writing into `target`.
    fn apply(
        &self,
        child: &Contract,
        target: Contract,
        mapping: &[BackflowMapping],
    ) -> Result<Contract, BackflowError> {
        if mapping.is_empty() {
            return Ok(target);
        }

        let context = json!({ "contract": child });
        let mut document = serde_json::to_value(&target)?;

        for rule in mapping {
            let path = self.resolve_path(&rule.upstream_path, &context)?;
            let value = self.resolve_value(&rule.downstream_value, &context)?;
            set_path(&mut document, &path, value)?;
        }

        Ok(serde_json::from_value(document)?)
    }

    fn resolve_value(&self, value: &FormulaOrValue, context: &Value) -> Result<Value, BackflowError> {
        match value {
            FormulaOrValue::Formula(formula) => self
                .evaluator
                .evaluate(&formula.formula, context)
                .map_err(BackflowError::Formula),
            FormulaOrValue::Value(value) => Ok(value.clone()),
        }
    }

    fn resolve_path(
        &self,
        path: &FormulaOrValue,
        context: &Value,
    ) -> Result<Vec<String>, BackflowError> {
        let segments = match self.resolve_value(path, context)? {
            Value::String(path) => path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(BackflowError::InvalidPath(format!(
                        "path segment {} is not a string",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                return Err(BackflowError::InvalidPath(format!(
                    "{} is not a path",
                    other
                )))
            }
        };

        if segments.is_empty() {
            return Err(BackflowError::InvalidPath("empty path".to_string()));
        }
        Ok(segments)
    }
}

/// Write `value` at `path`, creating missing objects along the way.
fn set_path(document: &mut Value, path: &[String], value: Value) -> Result<(), BackflowError> {
    let Some((last, parents)) = path.split_last() else {
        return Err(BackflowError::InvalidPath("empty path".to_string()));
    };

    let mut current = document;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| {
                    BackflowError::InvalidPath(format!("no element {} in {}", segment, path.join(".")))
                })?,
            _ => {
                return Err(BackflowError::InvalidPath(format!(
                    "{} does not lead to an object",
                    path.join(".")
                )))
            }
        };
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
    }

    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| {
                    BackflowError::InvalidPath(format!("no element {} in {}", last, path.join(".")))
                })?;
            *slot = value;
            Ok(())
        }
        _ => Err(BackflowError::InvalidPath(format!(
            "{} does not lead to an object",
            path.join(".")
        ))),
    }
}
