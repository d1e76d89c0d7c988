//! Game entity data and local transform operations
//!
//! A [`GameEntity`] is pure data plus the math that only needs the entity
//! itself: the local matrix, orientation control and world-space queries on
//! an already refreshed world matrix. Anything that walks the hierarchy lives
//! on [`EntityGraph`](crate::graph::EntityGraph), which owns every entity.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

use crate::foundation::math::{
    self, extract_rotation, extract_translation, Mat4, Quat, Transform, Vec3,
};

new_key_type! {
    /// Arena key of an entity inside an [`EntityGraph`](crate::graph::EntityGraph)
    pub struct EntityKey;
}

/// Process-unique, stable identifier of an entity
///
/// Survives serialization, unlike [`EntityKey`] which is only meaningful
/// inside one graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Fresh random identifier (upper-case UUID v4)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().to_uppercase())
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies the [`EntityManager`](crate::manager::EntityManager) an entity
/// is registered with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(u32);

impl ManagerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ray used for line-of-sight queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    /// Ray origin
    pub origin: Vec3,
    /// Normalized direction
    pub direction: Vec3,
}

impl Ray {
    /// Create a ray, normalizing the direction
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    /// Point at distance `t` along the ray
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

/// Payload attached to a [`Telegram`]
pub type MessageData = ron::Value;

/// A message travelling from one entity to another
#[derive(Debug, Clone, PartialEq)]
pub struct Telegram {
    /// Sending entity
    pub sender: EntityKey,
    /// Receiving entity
    pub receiver: EntityKey,
    /// Message type
    pub message: String,
    /// Remaining delay in seconds; zero means immediate delivery
    pub delay: f64,
    /// Optional payload
    pub data: Option<MessageData>,
}

impl Telegram {
    /// Create a telegram
    pub fn new(
        sender: EntityKey,
        receiver: EntityKey,
        message: impl Into<String>,
        delay: f64,
        data: Option<MessageData>,
    ) -> Self {
        Self {
            sender,
            receiver,
            message: message.into(),
            delay,
            data,
        }
    }
}

/// Capability hooks a specialised entity can opt into
///
/// Every method has the behaviour of a plain entity as its default, so an
/// implementation only overrides what it cares about.
pub trait EntityBehavior {
    /// Called once, before the first `update`
    fn start(&mut self, _entity: &mut GameEntity) {}

    /// Called every tick with the delta in seconds
    fn update(&mut self, _entity: &mut GameEntity, _delta: f64) {}

    /// React to a message. Returns `true` if the message was handled.
    fn handle_message(&mut self, _entity: &mut GameEntity, _telegram: &Telegram) -> bool {
        false
    }

    /// Where, if anywhere, this entity blocks `ray`
    ///
    /// `None` means the entity does not block line of sight at all; a hit at
    /// the ray origin is `Some(ray.origin)`.
    fn line_of_sight_test(&self, _entity: &GameEntity, _ray: &Ray) -> Option<Vec3> {
        None
    }
}

/// A node of the spatial entity graph
#[derive(Debug, Clone, PartialEq)]
pub struct GameEntity {
    id: EntityId,

    /// Display name
    pub name: String,
    /// Inactive entities are skipped by the manager's update pass
    pub active: bool,

    parent: Option<EntityKey>,
    children: Vec<EntityKey>,

    /// Entities inside the neighborhood radius, filled in by the manager
    pub neighbors: Vec<EntityKey>,
    /// Query radius used when refreshing `neighbors`
    pub neighborhood_radius: f32,
    /// Whether the manager refreshes `neighbors` every tick
    pub update_neighborhood: bool,

    /// Position relative to the parent
    pub position: Vec3,
    /// Rotation relative to the parent
    pub rotation: Quat,
    /// Scale relative to the parent
    pub scale: Vec3,

    /// Local forward axis
    pub forward: Vec3,
    /// Local up axis
    pub up: Vec3,

    /// Radius of the bounding sphere
    pub bounding_radius: f32,
    /// Maximum turn rate in radians per second
    pub max_turn_rate: f32,
    /// Whether this entity can activate triggers
    pub can_activate_trigger: bool,

    local_matrix: Mat4,
    world_matrix: Mat4,

    manager: Option<ManagerId>,
    started: bool,
}

impl Default for GameEntity {
    fn default() -> Self {
        Self::new()
    }
}

impl GameEntity {
    /// Create a detached entity with a fresh identifier
    pub fn new() -> Self {
        Self {
            id: EntityId::generate(),
            name: String::new(),
            active: true,
            parent: None,
            children: Vec::new(),
            neighbors: Vec::new(),
            neighborhood_radius: 1.0,
            update_neighborhood: false,
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
            forward: Vec3::new(0.0, 0.0, 1.0),
            up: Vec3::new(0.0, 1.0, 0.0),
            bounding_radius: 0.0,
            max_turn_rate: std::f32::consts::PI,
            can_activate_trigger: true,
            local_matrix: Mat4::identity(),
            world_matrix: Mat4::identity(),
            manager: None,
            started: false,
        }
    }

    /// Builder pattern: Use an explicit identifier
    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder pattern: Set name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder pattern: Set position
    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    /// Builder pattern: Set rotation
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Builder pattern: Set scale
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Stable identifier
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Parent entity, if attached
    pub fn parent(&self) -> Option<EntityKey> {
        self.parent
    }

    /// Owned children in insertion order
    pub fn children(&self) -> &[EntityKey] {
        &self.children
    }

    /// Manager this entity is registered with
    pub fn manager(&self) -> Option<ManagerId> {
        self.manager
    }

    /// Whether the start hook already ran
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Matrix built from position, rotation and scale at the last refresh
    pub fn local_matrix(&self) -> &Mat4 {
        &self.local_matrix
    }

    /// Local-to-world matrix at the last refresh
    ///
    /// Identity until the graph refreshes it for the first time.
    pub fn world_matrix(&self) -> &Mat4 {
        &self.world_matrix
    }

    /// Local transform components
    pub fn transform(&self) -> Transform {
        Transform::new(self.position, self.rotation, self.scale)
    }

    /// Recompute the local matrix from position, rotation and scale
    pub fn update_matrix(&mut self) {
        self.local_matrix = self.transform().to_matrix();
    }

    /// Look direction in the parent's space
    pub fn get_direction(&self) -> Vec3 {
        (self.rotation * self.forward).normalize()
    }

    /// Look direction in world space
    ///
    /// Reads the cached world matrix; it is not refreshed here.
    pub fn get_world_direction(&self) -> Vec3 {
        (extract_rotation(&self.world_matrix) * self.forward).normalize()
    }

    /// Position in world space, read from the cached world matrix
    pub fn get_world_position(&self) -> Vec3 {
        extract_translation(&self.world_matrix)
    }

    /// Rotation that makes this entity face `target`
    ///
    /// `target` must differ from `position`; `None` otherwise.
    fn rotation_towards(&self, target: &Vec3) -> Option<Quat> {
        let offset = target - self.position;
        if offset.norm_squared() == 0.0 {
            log::warn!("Entity {} asked to face its own position", self.id);
            return None;
        }
        Some(math::look_rotation(&self.forward, &offset.normalize(), &self.up))
    }

    /// Turn this entity so it directly faces `target`
    pub fn look_at(&mut self, target: &Vec3) {
        if let Some(rotation) = self.rotation_towards(target) {
            self.rotation = rotation;
        }
    }

    /// Turn towards `target`, at most `max_turn_rate * delta` radians
    ///
    /// Returns `true` once the remaining angle is below `tolerance`; the
    /// rotation is left untouched from then on.
    pub fn rotate_to(&mut self, target: &Vec3, delta: f32, tolerance: f32) -> bool {
        match self.rotation_towards(target) {
            Some(rotation) => {
                math::rotate_towards(&mut self.rotation, &rotation, self.max_turn_rate * delta, tolerance)
            }
            None => true,
        }
    }

    pub(crate) fn set_parent(&mut self, parent: Option<EntityKey>) {
        self.parent = parent;
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<EntityKey> {
        &mut self.children
    }

    pub(crate) fn set_world_matrix(&mut self, world_matrix: Mat4) {
        self.world_matrix = world_matrix;
    }

    pub(crate) fn set_manager(&mut self, manager: Option<ManagerId>) {
        self.manager = manager;
    }

    pub(crate) fn mark_started(&mut self) -> bool {
        !std::mem::replace(&mut self.started, true)
    }

    pub(crate) fn set_started(&mut self, started: bool) {
        self.started = started;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::PI;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_defaults() {
        let entity = GameEntity::new();

        assert!(!entity.id().as_str().is_empty());
        assert_eq!(entity.name, "");
        assert!(entity.active);
        assert!(entity.parent().is_none());
        assert!(entity.children().is_empty());
        assert!(entity.neighbors.is_empty());
        assert_eq!(entity.neighborhood_radius, 1.0);
        assert!(!entity.update_neighborhood);
        assert_eq!(entity.scale, Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(entity.forward, Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(entity.up, Vec3::new(0.0, 1.0, 0.0));
        assert_eq!(entity.bounding_radius, 0.0);
        assert_eq!(entity.max_turn_rate, PI);
        assert!(entity.can_activate_trigger);
        assert_eq!(*entity.world_matrix(), Mat4::identity());
        assert!(entity.manager().is_none());
        assert!(!entity.is_started());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = GameEntity::new();
        let b = GameEntity::new();
        assert_ne!(a.id(), b.id());

        let fixed = GameEntity::new().with_id("4C06581E-448A-4557-835E-7A9D2CE20D30");
        assert_eq!(fixed.id().as_str(), "4C06581E-448A-4557-835E-7A9D2CE20D30");
    }

    #[test]
    fn test_update_matrix_composes_trs() {
        let mut entity = GameEntity::new()
            .with_position(Vec3::new(1.0, 1.0, 1.0))
            .with_scale(Vec3::new(2.0, 2.0, 2.0));
        entity.update_matrix();

        assert_eq!(
            entity.local_matrix().as_slice(),
            &[2.0, 0.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 2.0, 0.0, 1.0, 1.0, 1.0, 1.0]
        );
    }

    #[test]
    fn test_get_direction_default_is_forward() {
        let entity = GameEntity::new();
        assert_eq!(entity.get_direction(), Vec3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn test_look_at_turns_around() {
        let mut entity = GameEntity::new();
        entity.look_at(&Vec3::new(0.0, 0.0, -1.0));

        assert_relative_eq!(entity.rotation.i.abs(), 0.0, epsilon = EPSILON);
        assert_relative_eq!(entity.rotation.j.abs(), 1.0, epsilon = EPSILON);
        assert_relative_eq!(entity.rotation.k.abs(), 0.0, epsilon = EPSILON);
        assert_relative_eq!(entity.rotation.w.abs(), 0.0, epsilon = EPSILON);
        assert_relative_eq!(entity.get_direction(), Vec3::new(0.0, 0.0, -1.0), epsilon = EPSILON);
    }

    #[test]
    fn test_look_at_own_position_keeps_rotation() {
        let mut entity = GameEntity::new().with_position(Vec3::new(1.0, 2.0, 3.0));
        entity.look_at(&Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(entity.rotation, Quat::identity());
    }

    #[test]
    fn test_rotate_to_halves_then_arrives() {
        let mut entity = GameEntity::new();
        let target = Vec3::new(0.0, 0.0, -1.0);

        assert!(!entity.rotate_to(&target, 0.5, 1e-4));
        assert_relative_eq!(entity.rotation.i, 0.0, epsilon = 1e-5);
        assert_relative_eq!(entity.rotation.j, std::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-5);
        assert_relative_eq!(entity.rotation.k, 0.0, epsilon = 1e-5);
        assert_relative_eq!(entity.rotation.w, std::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-5);

        entity.rotate_to(&target, 0.5, 1e-4);
        assert_relative_eq!(entity.rotation.i, 0.0, epsilon = 1e-5);
        assert_relative_eq!(entity.rotation.j, 1.0, epsilon = 1e-5);
        assert_relative_eq!(entity.rotation.k, 0.0, epsilon = 1e-5);
        assert_relative_eq!(entity.rotation.w, 0.0, epsilon = 1e-5);

        let converged = entity.rotation;
        assert!(entity.rotate_to(&target, 0.5, 1e-4));
        assert_eq!(entity.rotation, converged);
    }

    #[test]
    fn test_rotate_to_respects_turn_rate() {
        let mut entity = GameEntity::new();
        entity.max_turn_rate = 0.1;
        entity.rotate_to(&Vec3::new(1.0, 0.0, 0.0), 1.0, 1e-4);
        assert_relative_eq!(math::angle_between(&Quat::identity(), &entity.rotation), 0.1, epsilon = 1e-5);
    }

    #[test]
    fn test_world_queries_read_cached_matrix() {
        let mut entity = GameEntity::new();
        let facing_left = math::look_rotation(&entity.forward, &Vec3::new(-1.0, 0.0, 0.0), &entity.up);
        entity.set_world_matrix(Transform::new(Vec3::new(1.0, 1.0, 1.0), facing_left, Vec3::new(2.0, 2.0, 2.0)).to_matrix());

        assert_relative_eq!(entity.get_world_direction(), Vec3::new(-1.0, 0.0, 0.0), epsilon = 1e-5);
        assert_relative_eq!(entity.get_world_position(), Vec3::new(1.0, 1.0, 1.0), epsilon = EPSILON);
        // local state untouched
        assert_eq!(entity.get_direction(), Vec3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn test_ray_at() {
        let ray = Ray::new(Vec3::zeros(), Vec3::new(0.0, 0.0, 2.0));
        assert_relative_eq!(ray.at(3.0), Vec3::new(0.0, 0.0, 3.0), epsilon = EPSILON);
    }
}
