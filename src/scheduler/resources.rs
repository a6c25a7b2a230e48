//! Resource view consumed by the scheduling pipeline
//!
//! A top-level resource unit holds a map of child fragments; only leaves
//! carry capacity. Fragments are kept in a `BTreeMap` so iteration order is
//! deterministic within a run, which the cyclic prefilter reset relies on.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::domain_types::{InstanceId, RequestId, TraceId};

/// Operational status of a resource unit. Only `Normal` units are eligible
/// for placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitStatus {
    #[default]
    Normal,
    Evicting,
    Recovering,
    ToBeDeleted,
}

impl UnitStatus {
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Evicting => "EVICTING",
            Self::Recovering => "RECOVERING",
            Self::ToBeDeleted => "TO_BE_DELETED",
        }
    }
}

/// A schedulable node/pod/fragment with capacity and labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUnit {
    pub id: String,
    pub status: UnitStatus,
    /// Named scalar capacities, e.g. `cpu`, `memory`.
    #[serde(default)]
    pub capacity: HashMap<String, f64>,
    /// Already-allocated share of each capacity.
    #[serde(default)]
    pub allocated: HashMap<String, f64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Child units keyed by fragment id; empty for leaves.
    #[serde(default)]
    pub fragments: BTreeMap<String, ResourceUnit>,
}

impl ResourceUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Remaining capacity of one named resource.
    #[must_use]
    pub fn available(&self, resource: &str) -> f64 {
        let capacity = self.capacity.get(resource).copied().unwrap_or(0.0);
        let allocated = self.allocated.get(resource).copied().unwrap_or(0.0);
        (capacity - allocated).max(0.0)
    }

    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.status == UnitStatus::Normal
    }
}

/// Affinity expressed as label selectors, per scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AffinityTerm {
    /// Labels a unit must carry to be considered.
    #[serde(default)]
    pub required: HashMap<String, String>,
    /// Labels that raise a unit's score when present.
    #[serde(default)]
    pub preferred: HashMap<String, String>,
}

impl AffinityTerm {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.preferred.is_empty()
    }
}

/// Placement affinity of an instance across the three scopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Affinity {
    #[serde(default)]
    pub instance: AffinityTerm,
    #[serde(default)]
    pub resource: AffinityTerm,
    #[serde(default)]
    pub inner: AffinityTerm,
}

impl Affinity {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instance.is_empty() && self.resource.is_empty() && self.inner.is_empty()
    }
}

/// The scheduling view of one placement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub request_id: RequestId,
    #[serde(default)]
    pub trace_id: TraceId,
    pub instance_id: InstanceId,
    pub function: String,
    /// Requested named scalar resources.
    #[serde(default)]
    pub resources: HashMap<String, f64>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub affinity: Affinity,
}

impl InstanceInfo {
    pub fn new(
        request_id: impl Into<String>,
        instance_id: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            request_id: RequestId::new(request_id.into()),
            trace_id: TraceId::default(),
            instance_id: InstanceId::new(instance_id.into()),
            function: function.into(),
            resources: HashMap::new(),
            priority: 0,
            labels: HashMap::new(),
            affinity: Affinity::default(),
        }
    }
}
