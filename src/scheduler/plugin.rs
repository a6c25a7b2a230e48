//! Plugin capability traits for the scheduling pipeline
//!
//! Four roles: a prefilter narrows the candidate set, filters decide
//! feasibility per unit, scorers rank feasible units, binders are currently
//! informational. Plugins are registered explicitly on the framework at
//! startup; there is no static registration.

use std::cmp::Ordering;
use std::collections::HashSet;

use super::cyclic::CyclicKeys;
use super::resources::{InstanceInfo, ResourceUnit};
use crate::error::Status;

/// Per-request scheduling scratch state shared across plugins.
#[derive(Debug, Default)]
pub struct ScheduleContext {
    unfeasible: HashSet<String>,
}

impl ScheduleContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear_unfeasible(&mut self) {
        self.unfeasible.clear();
    }

    #[must_use]
    pub fn is_feasible(&self, unit_id: &str) -> bool {
        !self.unfeasible.contains(unit_id)
    }

    pub fn tag_unfeasible(&mut self, unit_id: &str) {
        self.unfeasible.insert(unit_id.to_string());
    }
}

/// Common identity of every plugin.
pub trait SchedulePlugin: Send + Sync {
    fn name(&self) -> &str;
}

/// Narrows the candidate fragment ids for one request.
///
/// Exactly one prefilter runs per request: the first registered plugin whose
/// [`PrefilterPlugin::matched`] probe returns true.
pub trait PrefilterPlugin: SchedulePlugin {
    /// Whether this prefilter applies to the instance.
    fn matched(&self, _instance: &InstanceInfo) -> bool {
        true
    }

    /// The candidate id sequence, or an error status aborting selection.
    fn prefilter(
        &self,
        ctx: &mut ScheduleContext,
        instance: &InstanceInfo,
        resource_unit: &ResourceUnit,
    ) -> Result<CyclicKeys, Status>;
}

/// Outcome of filtering one unit.
#[derive(Debug, Clone, Default)]
pub struct Filtered {
    pub status: Status,
    /// A fatal error aborts the whole selection; ignored when `status` is ok.
    pub fatal: bool,
    /// How many further requests this unit could still take; -1 = unlimited.
    pub available_for_request: i32,
    /// Human-readable requirement that was not met, for aggregation.
    pub required: String,
}

impl Filtered {
    #[must_use]
    pub fn ok(available_for_request: i32) -> Self {
        Self {
            status: Status::ok(),
            fatal: false,
            available_for_request,
            required: String::new(),
        }
    }

    #[must_use]
    pub fn unfeasible(status: Status, required: impl Into<String>) -> Self {
        Self {
            status,
            fatal: false,
            available_for_request: 0,
            required: required.into(),
        }
    }

    #[must_use]
    pub fn fatal(status: Status) -> Self {
        Self {
            status,
            fatal: true,
            available_for_request: 0,
            required: String::new(),
        }
    }
}

/// Decides whether a single leaf unit meets the request's requirements.
pub trait FilterPlugin: SchedulePlugin {
    fn filter(
        &self,
        ctx: &mut ScheduleContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered;
}

/// A unit's weighted score, ordered for the feasible max-heap.
#[derive(Debug, Clone, Default)]
pub struct UnitScore {
    pub unit_id: String,
    pub score: f64,
    /// Heterogeneous-hardware product tag, when one scorer reports it.
    pub hetero_product: Option<String>,
    /// Minimum positive `available_for_request` seen across filters.
    pub available_for_request: i32,
}

impl UnitScore {
    #[must_use]
    pub fn new(unit_id: impl Into<String>, score: f64) -> Self {
        Self {
            unit_id: unit_id.into(),
            score,
            hetero_product: None,
            available_for_request: -1,
        }
    }
}

impl PartialEq for UnitScore {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.unit_id == other.unit_id
    }
}

impl Eq for UnitScore {}

impl PartialOrd for UnitScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UnitScore {
    /// Max-heap on score; ties broken by unit id for run-to-run determinism.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.unit_id.cmp(&self.unit_id))
    }
}

/// Ranks one feasible unit.
pub trait ScorePlugin: SchedulePlugin {
    fn score(
        &self,
        ctx: &mut ScheduleContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> UnitScore;
}

/// Reserved for future placement binding; informational today.
pub trait BindPlugin: SchedulePlugin {
    fn bind(&self, _instance: &InstanceInfo, _unit: &ResourceUnit) -> Status {
        Status::ok()
    }
}
