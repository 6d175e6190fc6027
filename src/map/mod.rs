//! The shared map: keyframes, map points, and the place-recognition index.

pub mod keyframe;
pub mod keyframe_db;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::{Feature, KeyFrame, ORB_NUM_LEVELS, ORB_SCALE_FACTOR};
pub use keyframe_db::KeyFrameDatabase;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
