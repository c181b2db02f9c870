use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one unit of dispatched work across the whole grid.
///
/// Equality is structural on the `(session, cycle, job)` triple, so the same
/// value keys cancellation, dependency queries and lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobSpecification {
    pub session_id: Uuid,
    pub cycle_id: u64,
    pub job_id: u64,
}

impl JobSpecification {
    pub fn new(session_id: Uuid, cycle_id: u64, job_id: u64) -> Self {
        Self {
            session_id,
            cycle_id,
            job_id,
        }
    }
}

impl std::fmt::Display for JobSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.session_id, self.cycle_id, self.job_id)
    }
}

/// Opaque identifier of one computed artifact. The scheduler only compares
/// and hashes these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpecification {
    pub target: String,
    pub value_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ValueSpecification {
    pub fn new(target: impl Into<String>, value_name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            value_name: value_name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// One computation step of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobItem {
    pub function_id: String,
    pub target: String,
    #[serde(default)]
    pub inputs: BTreeSet<ValueSpecification>,
    #[serde(default)]
    pub outputs: BTreeSet<ValueSpecification>,
}

impl JobItem {
    pub fn new(function_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            target: target.into(),
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
        }
    }

    pub fn with_input(mut self, value: ValueSpecification) -> Self {
        self.inputs.insert(value);
        self
    }

    pub fn with_output(mut self, value: ValueSpecification) -> Self {
        self.outputs.insert(value);
        self
    }
}

/// Outputs listed here go to the node-private cache; everything else is shared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHint {
    #[serde(default)]
    pub private_values: BTreeSet<ValueSpecification>,
}

impl CacheHint {
    pub fn all_shared() -> Self {
        Self::default()
    }

    pub fn is_private(&self, value: &ValueSpecification) -> bool {
        self.private_values.contains(value)
    }
}

/// A dispatchable unit of work. Built upstream and immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub specification: JobSpecification,
    pub function_repository_version: i64,
    pub items: Vec<JobItem>,
    #[serde(default)]
    pub cache_hint: CacheHint,
}

impl Job {
    pub fn new(specification: JobSpecification, function_repository_version: i64) -> Self {
        Self {
            specification,
            function_repository_version,
            items: Vec::new(),
            cache_hint: CacheHint::all_shared(),
        }
    }

    pub fn with_item(mut self, item: JobItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn with_cache_hint(mut self, cache_hint: CacheHint) -> Self {
        self.cache_hint = cache_hint;
        self
    }
}

/// Per-item outcome reported by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Success,
    Failure(String),
    /// The function could not run because some inputs were never produced.
    MissingInputs(BTreeSet<ValueSpecification>),
    /// Not invoked because the function is blacklisted on the node.
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResultItem {
    pub function_id: String,
    pub status: ItemStatus,
}

impl JobResultItem {
    pub fn success(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            status: ItemStatus::Success,
        }
    }

    pub fn failure(function_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            status: ItemStatus::Failure(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }
}

/// How a node finished a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Completed {
        items: Vec<JobResultItem>,
        duration: Duration,
    },
    Failed {
        reason: String,
    },
}

impl JobOutcome {
    pub fn completed(items: Vec<JobResultItem>, duration: Duration) -> Self {
        JobOutcome::Completed { items, duration }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        JobOutcome::Failed {
            reason: reason.into(),
        }
    }
}
