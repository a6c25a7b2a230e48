//! The prefilter → filter → score selection loop

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::plugin::{
    BindPlugin, Filtered, FilterPlugin, PrefilterPlugin, ScheduleContext, ScorePlugin, UnitScore,
};
use super::resources::{InstanceInfo, ResourceUnit};
use crate::error::{ErrorCode, Status};

/// Scorer names in the labelled-affinity family get this default weight.
const LABEL_AFFINITY_WEIGHT: f64 = 100.0;
/// All other scorers default to weight 1.
const DEFAULT_WEIGHT: f64 = 1.0;

/// Scorer names carrying the labelled-affinity default weight.
const LABEL_AFFINITY_SCORERS: &[&str] = &[
    "label-affinity-scorer",
    "relaxed-label-affinity-scorer",
    "strict-label-affinity-scorer",
];

/// Outcome of one selection run: a status and the ranked feasible heap.
#[derive(Debug)]
pub struct ScheduleResults {
    pub status: Status,
    pub feasible: BinaryHeap<UnitScore>,
}

impl ScheduleResults {
    fn failure(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            status: Status::error(code, reason),
            feasible: BinaryHeap::new(),
        }
    }
}

/// Collects per-reason failure counts for the final aggregated message.
#[derive(Debug, Default)]
struct AggregatedStatus {
    counts: HashMap<String, u32>,
    requests: HashMap<String, String>,
}

impl AggregatedStatus {
    fn insert(&mut self, status: &Status, required: String) {
        let count = self.counts.entry(status.message.clone()).or_insert(0);
        if *count == 0 {
            self.requests.insert(status.message.clone(), required);
        }
        *count += 1;
    }

    fn dump(&self, desc: &str) -> String {
        let mut out = String::from(desc);
        if self.counts.is_empty() {
            out.push_str(", ");
            return out;
        }
        out.push_str(", The reasons are as follows:\n");
        let mut reasons: Vec<_> = self.counts.iter().collect();
        reasons.sort();
        for (reason, count) in reasons {
            out.push_str(&format!("\t{count} unit with [{reason}]"));
            if let Some(required) = self.requests.get(reason) {
                if !required.is_empty() {
                    out.push_str(&format!(" requirements: [{required}]"));
                }
            }
            out.push_str(".\n");
        }
        out
    }
}

/// The plugin pipeline executed once per request against one top-level
/// resource unit. Registration order of filters and scorers is preserved.
pub struct ScheduleFramework {
    prefilters: Vec<Arc<dyn PrefilterPlugin>>,
    filters: Vec<Arc<dyn FilterPlugin>>,
    scorers: Vec<Arc<dyn ScorePlugin>>,
    binders: Vec<Arc<dyn BindPlugin>>,
    score_weights: HashMap<String, f64>,
    /// Early-stop threshold on the feasible heap; -1 scans exhaustively.
    relaxed: i32,
    /// Cursor for the cyclic prefilter reset across successive calls.
    lately_selected: Option<String>,
}

impl ScheduleFramework {
    #[must_use]
    pub fn new(relaxed: i32) -> Self {
        Self {
            prefilters: Vec::new(),
            filters: Vec::new(),
            scorers: Vec::new(),
            binders: Vec::new(),
            score_weights: HashMap::new(),
            relaxed,
            lately_selected: None,
        }
    }

    pub fn register_prefilter(&mut self, plugin: Arc<dyn PrefilterPlugin>) -> bool {
        if self.prefilters.iter().any(|p| p.name() == plugin.name()) {
            error!(plugin = plugin.name(), "duplicate prefilter plugin");
            return false;
        }
        self.prefilters.push(plugin);
        true
    }

    pub fn register_filter(&mut self, plugin: Arc<dyn FilterPlugin>) -> bool {
        if self.filters.iter().any(|p| p.name() == plugin.name()) {
            error!(plugin = plugin.name(), "duplicate filter plugin");
            return false;
        }
        self.filters.push(plugin);
        true
    }

    pub fn register_scorer(&mut self, plugin: Arc<dyn ScorePlugin>) -> bool {
        if self.scorers.iter().any(|p| p.name() == plugin.name()) {
            error!(plugin = plugin.name(), "duplicate score plugin");
            return false;
        }
        let weight = if LABEL_AFFINITY_SCORERS.contains(&plugin.name()) {
            LABEL_AFFINITY_WEIGHT
        } else {
            DEFAULT_WEIGHT
        };
        self.score_weights.insert(plugin.name().to_string(), weight);
        self.scorers.push(plugin);
        true
    }

    pub fn register_binder(&mut self, plugin: Arc<dyn BindPlugin>) -> bool {
        if self.binders.iter().any(|p| p.name() == plugin.name()) {
            error!(plugin = plugin.name(), "duplicate bind plugin");
            return false;
        }
        self.binders.push(plugin);
        true
    }

    /// Overrides one scorer's weight.
    pub fn set_score_weight(&mut self, name: &str, weight: f64) {
        self.score_weights.insert(name.to_string(), weight);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.prefilters.len() + self.filters.len() + self.scorers.len();
        self.prefilters.retain(|p| p.name() != name);
        self.filters.retain(|p| p.name() != name);
        self.scorers.retain(|p| p.name() != name);
        let removed = before > self.prefilters.len() + self.filters.len() + self.scorers.len();
        if !removed {
            warn!(plugin = name, "plugin not registered, nothing to remove");
        }
        removed
    }

    /// Produces the ranked set of feasible fragments for one request.
    pub fn select_feasible(
        &mut self,
        ctx: &mut ScheduleContext,
        instance: &InstanceInfo,
        resource_unit: &ResourceUnit,
        expected_feasible: u32,
    ) -> ScheduleResults {
        info!(
            request = %instance.request_id,
            instance = %instance.instance_id,
            function = %instance.function,
            "scheduling instance"
        );
        ctx.clear_unfeasible();

        let Some(prefilter) = self
            .prefilters
            .iter()
            .find(|plugin| plugin.matched(instance))
        else {
            return ScheduleResults::failure(
                ErrorCode::SchedulePluginConfig,
                "invalid prefilter plugin, please check the schedule plugin configuration",
            );
        };
        let mut candidates = match prefilter.prefilter(ctx, instance, resource_unit) {
            Ok(candidates) => candidates,
            Err(status) => {
                error!(
                    request = %instance.request_id,
                    instance = %instance.instance_id,
                    %status,
                    "prefilter failed"
                );
                return ScheduleResults {
                    status,
                    feasible: BinaryHeap::new(),
                };
            }
        };
        if let Some(cursor) = self.lately_selected.as_deref() {
            candidates.reset(cursor);
        }

        let mut feasible: BinaryHeap<UnitScore> = BinaryHeap::new();
        let mut aggregate = AggregatedStatus::default();
        for candidate in candidates.iter() {
            if self.reached_relaxed(feasible.len(), expected_feasible) {
                break;
            }
            let Some(unit) = resource_unit.fragments.get(candidate) else {
                continue;
            };
            if !unit.is_normal() {
                warn!(
                    unit = %unit.id,
                    status = unit.status.describe(),
                    "resource unit unavailable to schedule"
                );
                aggregate.insert(
                    &Status::error(
                        ErrorCode::ResourceNotEnough,
                        format!(
                            "unavailable to schedule, the status of resource unit is {}",
                            unit.status.describe()
                        ),
                    ),
                    String::new(),
                );
                continue;
            }
            let filtered = self.filter(ctx, instance, unit);
            if filtered.status.is_err() {
                if filtered.fatal {
                    return ScheduleResults {
                        status: filtered.status,
                        feasible: BinaryHeap::new(),
                    };
                }
                aggregate.insert(&filtered.status, filtered.required);
                continue;
            }
            let mut score = self.score(ctx, instance, unit);
            score.available_for_request = filtered.available_for_request;
            feasible.push(score);
            self.lately_selected = Some(unit.id.clone());
        }

        if feasible.is_empty() {
            let reason =
                aggregate.dump("no available resource that meets the request requirements");
            error!(
                request = %instance.request_id,
                instance = %instance.instance_id,
                reason,
                "failed to schedule instance"
            );
            return ScheduleResults::failure(ErrorCode::ResourceNotEnough, reason);
        }
        ScheduleResults {
            status: Status::ok(),
            feasible,
        }
    }

    fn filter(
        &self,
        ctx: &mut ScheduleContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered {
        if self.filters.is_empty() {
            warn!("no filter plugin registered");
            return Filtered::fatal(Status::error(
                ErrorCode::SchedulePluginConfig,
                "empty filter plugin, please check the schedule plugin configuration",
            ));
        }
        let mut available_for_request = -1;
        for plugin in &self.filters {
            let filtered = plugin.filter(ctx, instance, unit);
            if filtered.status.is_ok() {
                if filtered.available_for_request > 0 {
                    available_for_request = if available_for_request == -1 {
                        filtered.available_for_request
                    } else {
                        available_for_request.min(filtered.available_for_request)
                    };
                }
                continue;
            }
            if filtered.fatal {
                error!(
                    request = %instance.request_id,
                    instance = %instance.instance_id,
                    plugin = plugin.name(),
                    status = %filtered.status,
                    "filter raised fatal error"
                );
            }
            // Either way the unit is not feasible; fatal additionally aborts
            // the whole selection in the caller.
            return filtered;
        }
        Filtered::ok(available_for_request)
    }

    fn score(
        &self,
        ctx: &mut ScheduleContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> UnitScore {
        let mut result = UnitScore::new(unit.id.clone(), 0.0);
        if self.scorers.is_empty() {
            warn!("no score plugin registered");
            return result;
        }
        for plugin in &self.scorers {
            let plugin_score = plugin.score(ctx, instance, unit);
            let weight = self
                .score_weights
                .get(plugin.name())
                .copied()
                .unwrap_or(DEFAULT_WEIGHT);
            result.score += plugin_score.score * weight;
            if plugin_score.hetero_product.is_some() {
                result.hetero_product = plugin_score.hetero_product;
            }
        }
        result
    }

    fn reached_relaxed(&self, feasible: usize, expected_feasible: u32) -> bool {
        if self.relaxed <= 0 {
            return false;
        }
        feasible >= (self.relaxed as u32).max(expected_feasible) as usize
    }
}
