//! Snapshot codec
//!
//! Entities reference each other (parent, children, neighbors), possibly in
//! cycles and possibly forward. Loading therefore runs in two phases:
//!
//! 1. **Structural**: every [`EntityRecord`] becomes an [`UnresolvedEntity`]
//!    holding a reference-free [`GameEntity`] plus the raw identifiers.
//! 2. **Resolution**: once every entity is in the graph, the raw identifiers
//!    are looked up in an id-to-key table and patched in. Identifiers that do
//!    not resolve are dropped.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{EntityId, EntityKey, GameEntity};
use crate::foundation::math::{Quat, Vec3};
use crate::graph::EntityGraph;

/// Snapshot errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),
}

/// Flat, serializable form of a [`GameEntity`]
///
/// References are stored as [`EntityId`]s; matrices are derived data and
/// are rebuilt on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity identifier
    pub id: EntityId,
    /// Display name
    pub name: String,
    /// Active flag
    pub active: bool,
    /// Parent identifier, if any
    pub parent: Option<EntityId>,
    /// Child identifiers in order
    pub children: Vec<EntityId>,
    /// Neighbor identifiers
    pub neighbors: Vec<EntityId>,
    /// Neighborhood query radius
    pub neighborhood_radius: f32,
    /// Whether neighbors are refreshed every tick
    pub update_neighborhood: bool,
    /// Local position
    pub position: Vec3,
    /// Local rotation
    pub rotation: Quat,
    /// Local scale
    pub scale: Vec3,
    /// Local forward axis
    pub forward: Vec3,
    /// Local up axis
    pub up: Vec3,
    /// Bounding sphere radius
    pub bounding_radius: f32,
    /// Turn rate in radians per second
    pub max_turn_rate: f32,
    /// Trigger activation flag
    pub can_activate_trigger: bool,
    /// Whether the start hook already ran
    #[serde(default)]
    pub started: bool,
}

/// Reference-free record of `key`, or `None` for an unknown key
///
/// Child and neighbor keys that no longer exist are skipped.
pub fn to_record(graph: &EntityGraph, key: EntityKey) -> Option<EntityRecord> {
    let entity = graph.get(key)?;
    let id_of = |key: &EntityKey| graph.get(*key).map(|e| e.id().clone());

    Some(EntityRecord {
        id: entity.id().clone(),
        name: entity.name.clone(),
        active: entity.active,
        parent: entity.parent().as_ref().and_then(id_of),
        children: entity.children().iter().filter_map(id_of).collect(),
        neighbors: entity.neighbors.iter().filter_map(id_of).collect(),
        neighborhood_radius: entity.neighborhood_radius,
        update_neighborhood: entity.update_neighborhood,
        position: entity.position,
        rotation: entity.rotation,
        scale: entity.scale,
        forward: entity.forward,
        up: entity.up,
        bounding_radius: entity.bounding_radius,
        max_turn_rate: entity.max_turn_rate,
        can_activate_trigger: entity.can_activate_trigger,
        started: entity.is_started(),
    })
}

/// Raw identifiers awaiting resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawReferences {
    /// Parent identifier
    pub parent: Option<EntityId>,
    /// Child identifiers
    pub children: Vec<EntityId>,
    /// Neighbor identifiers
    pub neighbors: Vec<EntityId>,
}

/// Output of the structural phase
#[derive(Debug, Clone)]
pub struct UnresolvedEntity {
    /// Entity with every non-reference field set and no references
    pub entity: GameEntity,
    /// References to patch in during resolution
    pub references: RawReferences,
}

impl UnresolvedEntity {
    /// Structural phase: copy every non-reference field, keep the ids aside
    pub fn from_record(record: EntityRecord) -> Self {
        let mut entity = GameEntity::new().with_id(record.id).with_name(record.name);
        entity.active = record.active;
        entity.neighborhood_radius = record.neighborhood_radius;
        entity.update_neighborhood = record.update_neighborhood;
        entity.position = record.position;
        entity.rotation = record.rotation;
        entity.scale = record.scale;
        entity.forward = record.forward;
        entity.up = record.up;
        entity.bounding_radius = record.bounding_radius;
        entity.max_turn_rate = record.max_turn_rate;
        entity.can_activate_trigger = record.can_activate_trigger;
        entity.set_started(record.started);

        Self {
            entity,
            references: RawReferences {
                parent: record.parent,
                children: record.children,
                neighbors: record.neighbors,
            },
        }
    }
}

impl EntityGraph {
    /// Resolution phase: patch raw identifiers of `key` into keys
    ///
    /// An unmapped parent becomes `None`; unmapped children and neighbors are
    /// dropped. Hierarchy lists are taken as given; consistency between the
    /// parent and child sides is the snapshot's responsibility.
    pub fn resolve_references(&mut self, key: EntityKey, raw: &RawReferences, id_map: &HashMap<EntityId, EntityKey>) {
        let resolve_list = |kind: &str, ids: &[EntityId]| -> Vec<EntityKey> {
            let mut seen = HashSet::new();
            ids.iter()
                .filter_map(|id| {
                    let resolved = id_map.get(id).copied();
                    if resolved.is_none() {
                        log::debug!("Dropping unresolved {} reference {}", kind, id);
                    }
                    resolved
                })
                .filter(|key| seen.insert(*key))
                .collect()
        };

        let parent = raw.parent.as_ref().and_then(|id| {
            let resolved = id_map.get(id).copied();
            if resolved.is_none() {
                log::debug!("Dropping unresolved parent reference {}", id);
            }
            resolved
        });
        let children = resolve_list("child", &raw.children);
        let neighbors = resolve_list("neighbor", &raw.neighbors);

        let Some(entity) = self.get_mut(key) else {
            log::warn!("Cannot resolve references of unknown entity {:?}", key);
            return;
        };
        entity.set_parent(parent);
        *entity.children_mut() = children;
        entity.neighbors = neighbors;
    }
}

/// Whole-graph snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Every entity of the graph
    pub entities: Vec<EntityRecord>,
}

impl GraphSnapshot {
    /// Flatten every entity of `graph`
    pub fn capture(graph: &EntityGraph) -> Self {
        let entities = graph
            .iter()
            .filter_map(|(key, _)| to_record(graph, key))
            .collect();
        Self { entities }
    }

    /// Rebuild a fresh graph
    pub fn restore(&self) -> EntityGraph {
        let mut graph = EntityGraph::new();
        self.restore_into(&mut graph);
        graph
    }

    /// Rebuild into an existing graph, returning the restored keys in
    /// record order
    ///
    /// References may point at entities already present in `graph`. A record
    /// whose id is already taken (by an entity of `graph` or an earlier
    /// record) is skipped with a warning, so the id keeps resolving to the
    /// entity that held it first.
    pub fn restore_into(&self, graph: &mut EntityGraph) -> Vec<EntityKey> {
        let mut pending: Vec<(EntityKey, RawReferences)> = Vec::with_capacity(self.entities.len());
        for record in &self.entities {
            if graph.key_of(&record.id).is_some() {
                log::warn!("Entity id {} already present, record skipped", record.id);
                continue;
            }
            let UnresolvedEntity { entity, references } = UnresolvedEntity::from_record(record.clone());
            pending.push((graph.insert(entity), references));
        }

        let id_map = graph.id_index().clone();
        for (key, references) in &pending {
            graph.resolve_references(*key, references, &id_map);
        }

        for (key, _) in &pending {
            if let Some(entity) = graph.get_mut(*key) {
                entity.update_matrix();
            }
        }
        graph.update_world_matrices();

        log::info!("Restored {} entities", pending.len());
        pending.into_iter().map(|(key, _)| key).collect()
    }

    /// Write as pretty RON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let contents = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| SnapshotError::Serialize(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Read a RON snapshot
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let contents = std::fs::read_to_string(path)?;
        ron::from_str(&contents).map_err(|e| SnapshotError::Parse(e.to_string()))
    }
}
