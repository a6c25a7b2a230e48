//! Pluggable scheduling framework
//!
//! Given one placement request and a resource view, the framework runs its
//! prefilter → filter → score pipeline and produces a ranked heap of
//! feasible fragments. Plugins are capability traits registered explicitly
//! at startup; filters run in registration order and only `Normal` units
//! ever reach them.

mod cyclic;
mod framework;
mod plugin;
mod plugins;
mod resources;

pub use cyclic::CyclicKeys;
pub use framework::{ScheduleFramework, ScheduleResults};
pub use plugin::{
    BindPlugin, Filtered, FilterPlugin, PrefilterPlugin, ScheduleContext, SchedulePlugin,
    ScorePlugin, UnitScore,
};
pub use plugins::{
    AffinityPrefilter, DefaultPrefilter, DefaultScorer, LabelAffinityScorer,
    ResourceSelectorFilter, register_named_plugins,
};
pub use resources::{Affinity, AffinityTerm, InstanceInfo, ResourceUnit, UnitStatus};
