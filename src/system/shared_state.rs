//! State shared between the tracking, local-mapping and loop-closing
//! threads.
//!
//! The map sits behind a single `RwLock`: readers (tracking, loop
//! detection) take shared guards, and every bulk mutation — keyframe pose
//! writes, map-point moves, replacements, covisibility refreshes — holds the
//! write guard, which serves as the map-update lock. The place-recognition
//! database has its own mutex and is only ever locked after the map, never
//! while holding it for writing.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::local_mapping::LocalMapper;
use crate::map::{KeyFrameDatabase, Map};

/// Shared state accessible by all SLAM threads.
pub struct SharedState {
    /// The map. Write guard = map-update lock.
    pub map: RwLock<Map>,

    /// Place-recognition database.
    pub keyframe_db: Mutex<KeyFrameDatabase>,

    /// Stop/release handshake with the local-mapping thread.
    pub local_mapper: LocalMapper,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(Map::new()),
            keyframe_db: Mutex::new(KeyFrameDatabase::new()),
            local_mapper: LocalMapper::new(),
        })
    }
}
