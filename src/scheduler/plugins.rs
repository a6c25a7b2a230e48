//! Stock scheduling plugins
//!
//! The default pipeline: an affinity-aware prefilter pair, a capacity-fit
//! filter, and least-allocated plus label-affinity scorers. Applications
//! register these explicitly; nothing is wired up statically.

use std::sync::Arc;
use tracing::debug;

use super::cyclic::CyclicKeys;
use super::framework::ScheduleFramework;
use super::plugin::{
    Filtered, FilterPlugin, PrefilterPlugin, ScheduleContext, SchedulePlugin, ScorePlugin,
    UnitScore,
};
use super::resources::{InstanceInfo, ResourceUnit};
use crate::error::{ErrorCode, Status};

/// Yields every fragment of the top-level unit.
pub struct DefaultPrefilter;

impl SchedulePlugin for DefaultPrefilter {
    fn name(&self) -> &str {
        "default-prefilter"
    }
}

impl PrefilterPlugin for DefaultPrefilter {
    fn prefilter(
        &self,
        _ctx: &mut ScheduleContext,
        _instance: &InstanceInfo,
        resource_unit: &ResourceUnit,
    ) -> Result<CyclicKeys, Status> {
        Ok(CyclicKeys::new(
            resource_unit.fragments.keys().cloned().collect(),
        ))
    }
}

/// Narrows candidates to fragments carrying the instance's required
/// resource-affinity labels. Selected only when such labels exist.
pub struct AffinityPrefilter;

impl SchedulePlugin for AffinityPrefilter {
    fn name(&self) -> &str {
        "affinity-prefilter"
    }
}

impl PrefilterPlugin for AffinityPrefilter {
    fn matched(&self, instance: &InstanceInfo) -> bool {
        !instance.affinity.resource.required.is_empty()
    }

    fn prefilter(
        &self,
        _ctx: &mut ScheduleContext,
        instance: &InstanceInfo,
        resource_unit: &ResourceUnit,
    ) -> Result<CyclicKeys, Status> {
        let required = &instance.affinity.resource.required;
        let keys: Vec<String> = resource_unit
            .fragments
            .values()
            .filter(|unit| {
                required
                    .iter()
                    .all(|(key, value)| unit.labels.get(key) == Some(value))
            })
            .map(|unit| unit.id.clone())
            .collect();
        if keys.is_empty() {
            return Err(Status::error(
                ErrorCode::ResourceNotEnough,
                format!("no resource unit carries required affinity labels {required:?}"),
            ));
        }
        debug!(candidates = keys.len(), "affinity prefilter narrowed candidates");
        Ok(CyclicKeys::new(keys))
    }
}

/// Capacity-fit filter: every requested scalar must fit in the unit's
/// remaining capacity.
pub struct ResourceSelectorFilter;

impl SchedulePlugin for ResourceSelectorFilter {
    fn name(&self) -> &str {
        "resource-selector-filter"
    }
}

impl FilterPlugin for ResourceSelectorFilter {
    fn filter(
        &self,
        ctx: &mut ScheduleContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered {
        let mut available_for_request = -1i32;
        for (resource, requested) in &instance.resources {
            if *requested <= 0.0 {
                continue;
            }
            let available = unit.available(resource);
            if available < *requested {
                ctx.tag_unfeasible(&unit.id);
                let required = instance
                    .resources
                    .iter()
                    .map(|(name, amount)| format!("{name}:{amount}"))
                    .collect::<Vec<_>>()
                    .join(",");
                return Filtered::unfeasible(
                    Status::error(
                        ErrorCode::ResourceNotEnough,
                        format!("Insufficient {resource}"),
                    ),
                    required,
                );
            }
            let rounds = (available / requested).floor() as i32;
            available_for_request = if available_for_request == -1 {
                rounds
            } else {
                available_for_request.min(rounds)
            };
        }
        Filtered::ok(available_for_request)
    }
}

/// Least-allocated scorer: emptier units score higher, spreading load.
pub struct DefaultScorer;

impl SchedulePlugin for DefaultScorer {
    fn name(&self) -> &str {
        "default-scorer"
    }
}

impl ScorePlugin for DefaultScorer {
    fn score(
        &self,
        _ctx: &mut ScheduleContext,
        _instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> UnitScore {
        let mut total = 0.0;
        let mut dimensions = 0u32;
        for (resource, capacity) in &unit.capacity {
            if *capacity <= 0.0 {
                continue;
            }
            total += unit.available(resource) / capacity;
            dimensions += 1;
        }
        let score = if dimensions == 0 {
            0.0
        } else {
            (total / f64::from(dimensions)) * 100.0
        };
        UnitScore::new(unit.id.clone(), score)
    }
}

/// Scores one point per preferred resource-affinity label the unit carries;
/// registered under the heavily weighted labelled-affinity family.
pub struct LabelAffinityScorer;

impl SchedulePlugin for LabelAffinityScorer {
    fn name(&self) -> &str {
        "label-affinity-scorer"
    }
}

impl ScorePlugin for LabelAffinityScorer {
    fn score(
        &self,
        _ctx: &mut ScheduleContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> UnitScore {
        let matched = instance
            .affinity
            .resource
            .preferred
            .iter()
            .filter(|(key, value)| unit.labels.get(*key) == Some(*value))
            .count();
        UnitScore::new(unit.id.clone(), matched as f64)
    }
}

/// Registers the stock pipeline by plugin name, in registration order.
///
/// Unknown names are skipped with an error status so a typo in the plugin
/// list surfaces at startup.
pub fn register_named_plugins(
    framework: &mut ScheduleFramework,
    names: &[String],
) -> Result<(), Status> {
    for name in names {
        let known = match name.as_str() {
            "default-prefilter" => framework.register_prefilter(Arc::new(DefaultPrefilter)),
            "affinity-prefilter" => framework.register_prefilter(Arc::new(AffinityPrefilter)),
            "resource-selector-filter" => {
                framework.register_filter(Arc::new(ResourceSelectorFilter))
            }
            "default-scorer" => framework.register_scorer(Arc::new(DefaultScorer)),
            "label-affinity-scorer" => framework.register_scorer(Arc::new(LabelAffinityScorer)),
            _ => {
                return Err(Status::error(
                    ErrorCode::SchedulePluginConfig,
                    format!("unknown schedule plugin: {name}"),
                ));
            }
        };
        if !known {
            return Err(Status::error(
                ErrorCode::SchedulePluginConfig,
                format!("duplicate schedule plugin: {name}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn leaf(id: &str, cpu_capacity: f64, cpu_allocated: f64) -> ResourceUnit {
        let mut unit = ResourceUnit::new(id);
        unit.capacity.insert("cpu".to_string(), cpu_capacity);
        unit.allocated.insert("cpu".to_string(), cpu_allocated);
        unit
    }

    fn cpu_instance(requested: f64) -> InstanceInfo {
        let mut instance = InstanceInfo::new("req-1", "instA", "echo");
        instance.resources.insert("cpu".to_string(), requested);
        instance
    }

    #[test]
    fn test_resource_filter_accepts_fitting_unit() {
        let mut ctx = ScheduleContext::new();
        let filtered =
            ResourceSelectorFilter.filter(&mut ctx, &cpu_instance(2.0), &leaf("a", 8.0, 2.0));
        assert!(filtered.status.is_ok());
        // 6 cpu available / 2 requested = 3 further requests fit.
        assert_eq!(filtered.available_for_request, 3);
    }

    #[test]
    fn test_resource_filter_rejects_and_reports_requirement() {
        let mut ctx = ScheduleContext::new();
        let filtered =
            ResourceSelectorFilter.filter(&mut ctx, &cpu_instance(4.0), &leaf("a", 4.0, 2.0));
        assert_eq!(filtered.status.code, Some(ErrorCode::ResourceNotEnough));
        assert_eq!(filtered.status.message, "Insufficient cpu");
        assert_eq!(filtered.required, "cpu:4");
        assert!(!ctx.is_feasible("a"));
    }

    #[test]
    fn test_default_scorer_prefers_emptier_units() {
        let mut ctx = ScheduleContext::new();
        let instance = cpu_instance(1.0);
        let empty = DefaultScorer.score(&mut ctx, &instance, &leaf("empty", 8.0, 0.0));
        let busy = DefaultScorer.score(&mut ctx, &instance, &leaf("busy", 8.0, 6.0));
        assert!(empty.score > busy.score);
    }

    #[test]
    fn test_affinity_prefilter_matches_only_with_required_labels() {
        let instance = cpu_instance(1.0);
        assert!(!AffinityPrefilter.matched(&instance));

        let mut pinned = instance.clone();
        pinned
            .affinity
            .resource
            .required
            .insert("zone".to_string(), "a".to_string());
        assert!(AffinityPrefilter.matched(&pinned));

        let mut top = ResourceUnit::new("node");
        let mut labelled = leaf("frag-1", 8.0, 0.0);
        labelled.labels.insert("zone".to_string(), "a".to_string());
        top.fragments.insert("frag-1".to_string(), labelled);
        top.fragments.insert("frag-2".to_string(), leaf("frag-2", 8.0, 0.0));

        let mut ctx = ScheduleContext::new();
        let keys = AffinityPrefilter
            .prefilter(&mut ctx, &pinned, &top)
            .expect("prefilter");
        let ids: Vec<&str> = keys.iter().collect();
        assert_eq!(ids, ["frag-1"]);
    }

    #[test]
    fn test_register_named_plugins_rejects_unknown_names() {
        let mut framework = ScheduleFramework::new(-1);
        let error = register_named_plugins(
            &mut framework,
            &["default-prefilter".to_string(), "no-such-plugin".to_string()],
        )
        .expect_err("unknown plugin must fail");
        assert_eq!(error.code, Some(ErrorCode::SchedulePluginConfig));
    }

    #[test]
    fn test_label_scorer_counts_preferred_matches() {
        let mut instance = cpu_instance(1.0);
        instance
            .affinity
            .resource
            .preferred
            .extend(HashMap::from([
                ("zone".to_string(), "a".to_string()),
                ("tier".to_string(), "hot".to_string()),
            ]));
        let mut unit = leaf("frag", 8.0, 0.0);
        unit.labels.insert("zone".to_string(), "a".to_string());

        let mut ctx = ScheduleContext::new();
        let score = LabelAffinityScorer.score(&mut ctx, &instance, &unit);
        assert_eq!(score.score, 1.0);
    }
}
