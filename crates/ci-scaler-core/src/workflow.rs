//! Workflow file parsing and runner-demand prediction.
//!
//! When a workflow run is requested, the ingress pipeline downloads the
//! workflow YAML and predicts how many runners each label will consume, so
//! the matching auto-scaling groups can be grown before jobs queue up. The
//! prediction walks the `jobs` mapping, multiplying by matrix fan-out and
//! capping at `max-parallel`.

use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// A parsed workflow file.
#[derive(Debug, Clone)]
pub struct Workflow {
    doc: Mapping,
}

/// Errors parsing a workflow file.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow file is not a YAML mapping")]
    NotAMapping,

    #[error("workflow YAML parse failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Workflow {
    pub fn parse(content: &str) -> Result<Self, WorkflowError> {
        match serde_yaml::from_str(content)? {
            Value::Mapping(doc) => Ok(Self { doc }),
            _ => Err(WorkflowError::NotAMapping),
        }
    }

    /// Predict the total runner demand this workflow introduces, per label.
    ///
    /// For each job under `jobs`:
    /// - `runs-on` is normalized to a list of strings; entries containing `$`
    ///   (unresolved expressions) are dropped;
    /// - the base count of 1 is multiplied by the length of every list-valued
    ///   `strategy.matrix` axis and capped at an integer
    ///   `strategy.max-parallel`;
    /// - the count is added to each surviving label.
    pub fn predict_labels(&self) -> BTreeMap<String, u32> {
        let mut labels: BTreeMap<String, u32> = BTreeMap::new();
        let Some(Value::Mapping(jobs)) = self.doc.get("jobs") else {
            return labels;
        };
        for job in jobs.values() {
            let Value::Mapping(job) = job else { continue };
            let runs_on = match job.get("runs-on") {
                Some(Value::String(label)) => vec![label.clone()],
                Some(Value::Sequence(entries)) => entries
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect(),
                _ => continue,
            };

            let mut count: u32 = 1;
            if let Some(Value::Mapping(strategy)) = job.get("strategy") {
                if let Some(Value::Mapping(matrix)) = strategy.get("matrix") {
                    for axis in matrix.values() {
                        if let Value::Sequence(shards) = axis {
                            count = count.saturating_mul(shards.len() as u32);
                        }
                    }
                    if let Some(max_parallel) =
                        strategy.get("max-parallel").and_then(Value::as_u64)
                    {
                        count = count.min(max_parallel as u32);
                    }
                }
            }

            for label in runs_on {
                if !label.contains('$') {
                    *labels.entry(label).or_insert(0) += count;
                }
            }
        }
        labels
    }
}

#[cfg(test)]
#[path = "workflow_tests.rs"]
mod tests;
