//! # Agent Runtime
//!
//! The runtime substrate for real-time game AI: a hierarchical spatial
//! entity graph driven by a simulation clock, with lifecycle hooks,
//! message passing, and a snapshot format that survives forward and
//! circular references.
//!
//! ## Features
//!
//! - **Simulation Clock**: wall-clock or fixed-step deltas, timescale, resync on resume
//! - **Entity Graph**: slotmap arena with parent/child transforms and orientation control
//! - **Messaging**: immediate and delayed telegrams routed through an entity manager
//! - **Snapshots**: two-phase construct-then-resolve loading from RON
//!
//! ## Quick Start
//!
//! ```rust
//! use agent_runtime::prelude::*;
//!
//! let mut manager = EntityManager::new();
//! let mut clock = SimulationClock::new();
//! clock.set_fixed_delta(1.0 / 60.0).enable_fixed_delta();
//!
//! let root = manager.graph_mut().spawn(GameEntity::new().with_position(Vec3::new(1.0, 1.0, 1.0)));
//! let child = manager.graph_mut().spawn(GameEntity::new().with_position(Vec3::new(0.0, 0.0, 1.0)));
//! manager.graph_mut().add(root, child).unwrap();
//! manager.register(root);
//!
//! clock.update();
//! manager.update(clock.delta());
//!
//! let world = manager.graph().get(child).unwrap().get_world_position();
//! assert!((world - Vec3::new(1.0, 1.0, 2.0)).norm() < 1e-6);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod core;
pub mod config;
pub mod foundation;

pub mod entity;
pub mod graph;
pub mod codec;
pub mod manager;

pub use entity::{EntityBehavior, EntityId, EntityKey, GameEntity, ManagerId, MessageData, Ray, Telegram};
pub use graph::{EntityGraph, GraphError};
pub use codec::{to_record, EntityRecord, GraphSnapshot, RawReferences, SnapshotError, UnresolvedEntity};
pub use manager::{EntityManager, MessageDispatcher};

/// Common imports for runtime users
pub mod prelude {
    pub use crate::{
        EntityBehavior, EntityId, EntityKey, GameEntity, Ray, Telegram,
        EntityGraph, GraphError,
        EntityRecord, GraphSnapshot, SnapshotError,
        EntityManager, MessageDispatcher,
        foundation::{
            math::{Vec3, Mat4, Quat, Transform},
            time::{SimulationClock, TimeSource, Visibility, VisibilitySignal},
        },
        core::config::SimulationConfig,
        config::{Config, ConfigError},
    };
}
