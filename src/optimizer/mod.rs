//! Graph optimization for loop closing.
//!
//! Three optimizers back the loop-closing pipeline:
//! - Sim3 refinement of a candidate loop transform over its matched points,
//! - essential-graph optimization spreading an accepted correction over the
//!   keyframe graph,
//! - global bundle adjustment refining the whole map in the background.

pub mod essential_graph;
pub mod global_ba;
pub mod sim3_optim;

pub use essential_graph::{optimize_essential_graph, EssentialGraphConfig};
pub use global_ba::{
    collect_global_ba_data, global_bundle_adjustment, solve_global_ba, stamp_global_ba_results,
    GlobalBaConfig, GlobalBaProblem, GlobalBaResult,
};
pub use sim3_optim::optimize_sim3;
