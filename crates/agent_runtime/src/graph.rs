//! Entity graph
//!
//! An arena that owns every [`GameEntity`] and keeps the hierarchy
//! consistent. Parent-to-child edges are ownership edges; everything else
//! (child-to-parent, neighbors) is a plain [`EntityKey`] lookup, so removing
//! an owning edge can never be held up by a back-reference.
//!
//! ```text
//!      root
//!     /    \
//!   arm    head        world = parent.world * local
//!    |
//!   hand
//! ```

use std::any::Any;
use std::collections::{HashMap, HashSet};

use slotmap::{SecondaryMap, SlotMap};
use thiserror::Error;

use crate::entity::{EntityBehavior, EntityId, EntityKey, GameEntity, Ray, Telegram};
use crate::foundation::math::{Mat4, Vec3};

/// Hierarchy errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Key does not refer to a live entity
    #[error("Unknown entity: {0:?}")]
    UnknownEntity(EntityKey),

    /// An entity cannot be its own parent
    #[error("Entity {0:?} cannot be added to itself")]
    SelfParent(EntityKey),

    /// The child is an ancestor of the would-be parent
    #[error("Adding {child:?} to {parent:?} would create a cycle")]
    Cycle {
        /// Would-be parent
        parent: EntityKey,
        /// Would-be child
        child: EntityKey,
    },
}

type SyncFn = Box<dyn FnMut(&GameEntity, &mut dyn Any)>;

/// Opaque presentation object plus the callback that copies entity state
/// onto it
struct RenderBinding {
    component: Box<dyn Any>,
    sync: SyncFn,
}

/// Arena of entities with hierarchy, behaviours and render bindings
#[derive(Default)]
pub struct EntityGraph {
    entities: SlotMap<EntityKey, GameEntity>,
    ids: HashMap<EntityId, EntityKey>,
    behaviors: SecondaryMap<EntityKey, Box<dyn EntityBehavior>>,
    bindings: SecondaryMap<EntityKey, RenderBinding>,
}

impl std::fmt::Debug for EntityGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGraph")
            .field("entities", &self.entities.len())
            .field("behaviors", &self.behaviors.len())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl EntityGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a detached entity
    ///
    /// Hierarchy fields of the incoming entity are cleared; use
    /// [`add`](Self::add) to attach it.
    pub fn spawn(&mut self, mut entity: GameEntity) -> EntityKey {
        entity.set_parent(None);
        entity.children_mut().clear();
        self.insert(entity)
    }

    /// Spawn an entity driven by `behavior`
    pub fn spawn_with_behavior(&mut self, entity: GameEntity, behavior: impl EntityBehavior + 'static) -> EntityKey {
        let key = self.spawn(entity);
        self.behaviors.insert(key, Box::new(behavior));
        key
    }

    /// Insert as-is, references included
    pub(crate) fn insert(&mut self, entity: GameEntity) -> EntityKey {
        let id = entity.id().clone();
        let key = self.entities.insert(entity);
        if let Some(previous) = self.ids.insert(id.clone(), key) {
            log::warn!("Entity id {} reused; {:?} no longer reachable by id", id, previous);
        }
        key
    }

    /// Destroy an entity together with every entity it owns
    ///
    /// Returns the number of entities released. Neighbor lists of the
    /// survivors are pruned.
    pub fn despawn(&mut self, key: EntityKey) -> usize {
        let Some(parent) = self.entities.get(key).map(GameEntity::parent) else {
            return 0;
        };
        if let Some(parent) = parent {
            self.remove(parent, key);
        }

        let mut released = HashSet::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if let Some(entity) = self.entities.remove(current) {
                stack.extend_from_slice(entity.children());
                self.behaviors.remove(current);
                self.bindings.remove(current);
                if self.ids.get(entity.id()) == Some(&current) {
                    self.ids.remove(entity.id());
                }
                released.insert(current);
            }
        }

        for entity in self.entities.values_mut() {
            entity.neighbors.retain(|neighbor| !released.contains(neighbor));
        }

        log::debug!("Released {} entities", released.len());
        released.len()
    }

    /// Entity by key
    pub fn get(&self, key: EntityKey) -> Option<&GameEntity> {
        self.entities.get(key)
    }

    /// Mutable entity by key
    ///
    /// Hierarchy fields stay read-only; go through [`add`](Self::add) and
    /// [`remove`](Self::remove).
    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut GameEntity> {
        self.entities.get_mut(key)
    }

    /// Whether `key` refers to a live entity
    pub fn contains(&self, key: EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    /// Key of the entity with the given identifier
    pub fn key_of(&self, id: &EntityId) -> Option<EntityKey> {
        self.ids.get(id).copied()
    }

    /// Identifier to key table
    pub fn id_index(&self) -> &HashMap<EntityId, EntityKey> {
        &self.ids
    }

    /// Number of entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the graph holds no entities
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All entities
    pub fn iter(&self) -> impl Iterator<Item = (EntityKey, &GameEntity)> {
        self.entities.iter()
    }

    /// Entities without a parent
    pub fn roots(&self) -> impl Iterator<Item = EntityKey> + '_ {
        self.entities
            .iter()
            .filter(|(_, entity)| entity.parent().is_none())
            .map(|(key, _)| key)
    }

    /// Whether `ancestor` is `key` itself or one of its parents
    pub fn is_ancestor(&self, ancestor: EntityKey, key: EntityKey) -> bool {
        let mut current = Some(key);
        // bounded walk, restored data may contain parent loops
        for _ in 0..=self.entities.len() {
            let Some(node) = current else {
                return false;
            };
            if node == ancestor {
                return true;
            }
            current = self.entities.get(node).and_then(GameEntity::parent);
        }
        false
    }

    /// Attach `child` to `parent`, detaching it from its old parent first
    pub fn add(&mut self, parent: EntityKey, child: EntityKey) -> Result<(), GraphError> {
        for key in [parent, child] {
            if !self.entities.contains_key(key) {
                return Err(GraphError::UnknownEntity(key));
            }
        }
        if parent == child {
            return Err(GraphError::SelfParent(child));
        }
        if self.is_ancestor(child, parent) {
            return Err(GraphError::Cycle { parent, child });
        }

        if let Some(old_parent) = self.entities[child].parent() {
            if old_parent == parent {
                return Ok(());
            }
            self.remove(old_parent, child);
        }

        self.entities[child].set_parent(Some(parent));
        let children = self.entities[parent].children_mut();
        if !children.contains(&child) {
            children.push(child);
        }
        Ok(())
    }

    /// Detach `child` from `parent`
    ///
    /// The child's own descendants stay attached to it. Returns `false` if
    /// `child` was not a child of `parent`.
    pub fn remove(&mut self, parent: EntityKey, child: EntityKey) -> bool {
        let Some(children) = self.entities.get_mut(parent).map(GameEntity::children_mut) else {
            return false;
        };
        let Some(index) = children.iter().position(|c| *c == child) else {
            return false;
        };
        children.remove(index);

        if let Some(entity) = self.entities.get_mut(child) {
            if entity.parent() == Some(parent) {
                entity.set_parent(None);
            }
        }
        true
    }

    /// Recompute the world matrix of `key`
    ///
    /// With `update_parents` the ancestors are refreshed first (root to
    /// `key`), with `update_children` the whole subtree afterwards.
    ///
    /// Every entity is refreshed at most once per call. A parent or child
    /// loop (only possible in restored data) is logged and cut at the
    /// repeated entity.
    pub fn update_world_matrix(&mut self, key: EntityKey, update_parents: bool, update_children: bool) {
        let Some(parent) = self.entities.get(key).map(GameEntity::parent) else {
            return;
        };
        let mut visited = HashSet::from([key]);

        if update_parents {
            let mut ancestors = Vec::new();
            let mut current = parent;
            while let Some(ancestor) = current {
                if !visited.insert(ancestor) {
                    log::warn!("Parent loop through {:?}, ancestor refresh stopped", ancestor);
                    break;
                }
                ancestors.push(ancestor);
                current = self.entities.get(ancestor).and_then(GameEntity::parent);
            }
            for ancestor in ancestors.into_iter().rev() {
                if self.entities.contains_key(ancestor) {
                    self.refresh(ancestor);
                }
            }
        }

        self.refresh(key);

        if update_children {
            let mut stack: Vec<EntityKey> = self.entities[key].children().iter().rev().copied().collect();
            while let Some(child) = stack.pop() {
                if !visited.insert(child) {
                    log::warn!("Hierarchy loop through {:?}, subtree refresh stopped there", child);
                    continue;
                }
                let Some(entity) = self.entities.get(child) else {
                    continue;
                };
                stack.extend(entity.children().iter().rev().copied());
                self.refresh(child);
            }
        }
    }

    /// Refresh every world matrix, roots first
    ///
    /// Tolerates malformed hierarchies (e.g. cyclic child lists from a
    /// hand-edited snapshot): each entity is visited once.
    pub fn update_world_matrices(&mut self) {
        let mut visited = HashSet::new();
        let mut stack: Vec<EntityKey> = self.roots().collect();
        stack.reverse();

        while let Some(key) = stack.pop() {
            if !self.entities.contains_key(key) || !visited.insert(key) {
                continue;
            }
            self.refresh(key);
            stack.extend(self.entities[key].children().iter().rev().copied());
        }

        if visited.len() < self.entities.len() {
            log::warn!(
                "{} entities are not reachable from a root, world matrices left stale",
                self.entities.len() - visited.len()
            );
        }
    }

    /// Local matrix, world matrix, render sync for a single entity
    fn refresh(&mut self, key: EntityKey) {
        let parent_world: Option<Mat4> = self.entities[key]
            .parent()
            .and_then(|parent| self.entities.get(parent))
            .map(|parent| *parent.world_matrix());

        let entity = &mut self.entities[key];
        entity.update_matrix();
        let world = match parent_world {
            Some(parent_world) => parent_world * entity.local_matrix(),
            None => *entity.local_matrix(),
        };
        entity.set_world_matrix(world);

        if let Some(binding) = self.bindings.get_mut(key) {
            (binding.sync)(entity, binding.component.as_mut());
        }
    }

    /// Bind a presentation object that is synced on every world matrix refresh
    pub fn set_render_component<R, F>(&mut self, key: EntityKey, component: R, mut sync: F)
    where
        R: Any,
        F: FnMut(&GameEntity, &mut R) + 'static,
    {
        if !self.entities.contains_key(key) {
            log::warn!("Render component for unknown entity {:?} ignored", key);
            return;
        }
        let sync: SyncFn = Box::new(move |entity, component| {
            if let Some(component) = component.downcast_mut::<R>() {
                sync(entity, component);
            }
        });
        self.bindings.insert(key, RenderBinding {
            component: Box::new(component),
            sync,
        });
    }

    /// Drop the render binding of `key`
    pub fn clear_render_component(&mut self, key: EntityKey) {
        self.bindings.remove(key);
    }

    /// Bound presentation object, if it is an `R`
    pub fn render_component<R: Any>(&self, key: EntityKey) -> Option<&R> {
        self.bindings.get(key)?.component.downcast_ref::<R>()
    }

    /// Replace the behaviour of an entity
    pub fn set_behavior(&mut self, key: EntityKey, behavior: impl EntityBehavior + 'static) {
        if self.entities.contains_key(key) {
            self.behaviors.insert(key, Box::new(behavior));
        }
    }

    /// Run the start hook once
    ///
    /// Returns `false` if the entity was already started.
    pub fn start(&mut self, key: EntityKey) -> bool {
        let Some(entity) = self.entities.get_mut(key) else {
            return false;
        };
        if !entity.mark_started() {
            return false;
        }
        if let Some(behavior) = self.behaviors.get_mut(key) {
            behavior.start(entity);
        }
        true
    }

    /// Run the per-tick update hook
    pub fn update(&mut self, key: EntityKey, delta: f64) {
        if let (Some(entity), Some(behavior)) = (self.entities.get_mut(key), self.behaviors.get_mut(key)) {
            behavior.update(entity, delta);
        }
    }

    /// Offer a message to the receiving entity
    ///
    /// Plain entities never handle messages.
    pub fn handle_message(&mut self, key: EntityKey, telegram: &Telegram) -> bool {
        let Some(entity) = self.entities.get_mut(key) else {
            log::warn!("Message '{}' for unknown entity {:?} dropped", telegram.message, key);
            return false;
        };
        self.behaviors
            .get_mut(key)
            .is_some_and(|behavior| behavior.handle_message(entity, telegram))
    }

    /// Where `key` blocks `ray`; `None` when it does not block at all
    pub fn line_of_sight_test(&self, key: EntityKey, ray: &Ray) -> Option<Vec3> {
        let entity = self.entities.get(key)?;
        self.behaviors.get(key)?.line_of_sight_test(entity, ray)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::extract_translation;
    use approx::assert_relative_eq;
    use std::cell::Cell;
    use std::rc::Rc;

    fn at(graph: &mut EntityGraph, x: f32, y: f32, z: f32) -> EntityKey {
        graph.spawn(GameEntity::new().with_position(Vec3::new(x, y, z)))
    }

    #[test]
    fn test_add_sets_both_sides() {
        let mut graph = EntityGraph::new();
        let parent = at(&mut graph, 0.0, 0.0, 0.0);
        let child = at(&mut graph, 0.0, 0.0, 0.0);

        graph.add(parent, child).unwrap();
        assert_eq!(graph.get(child).unwrap().parent(), Some(parent));
        assert_eq!(graph.get(parent).unwrap().children(), &[child]);

        // adding twice keeps a single entry
        graph.add(parent, child).unwrap();
        assert_eq!(graph.get(parent).unwrap().children(), &[child]);
    }

    #[test]
    fn test_reparent_moves_child() {
        let mut graph = EntityGraph::new();
        let first = at(&mut graph, 0.0, 0.0, 0.0);
        let second = at(&mut graph, 0.0, 0.0, 0.0);
        let child = at(&mut graph, 0.0, 0.0, 0.0);

        graph.add(first, child).unwrap();
        graph.add(second, child).unwrap();

        assert_eq!(graph.get(child).unwrap().parent(), Some(second));
        assert!(graph.get(first).unwrap().children().is_empty());
        assert_eq!(graph.get(second).unwrap().children(), &[child]);
    }

    #[test]
    fn test_remove_detaches_but_keeps_grandchildren() {
        let mut graph = EntityGraph::new();
        let root = at(&mut graph, 0.0, 0.0, 0.0);
        let child = at(&mut graph, 0.0, 0.0, 0.0);
        let grandchild = at(&mut graph, 0.0, 0.0, 0.0);
        graph.add(root, child).unwrap();
        graph.add(child, grandchild).unwrap();

        assert!(graph.remove(root, child));
        assert!(graph.get(child).unwrap().parent().is_none());
        assert!(graph.get(root).unwrap().children().is_empty());
        assert_eq!(graph.get(grandchild).unwrap().parent(), Some(child));

        assert!(!graph.remove(root, child));
    }

    #[test]
    fn test_add_rejects_cycles() {
        let mut graph = EntityGraph::new();
        let a = at(&mut graph, 0.0, 0.0, 0.0);
        let b = at(&mut graph, 0.0, 0.0, 0.0);
        graph.add(a, b).unwrap();

        assert_eq!(graph.add(a, a), Err(GraphError::SelfParent(a)));
        assert_eq!(graph.add(b, a), Err(GraphError::Cycle { parent: b, child: a }));
        assert!(graph.get(a).unwrap().parent().is_none());
    }

    #[test]
    fn test_add_unknown_key() {
        let mut graph = EntityGraph::new();
        let a = at(&mut graph, 0.0, 0.0, 0.0);
        let gone = at(&mut graph, 0.0, 0.0, 0.0);
        graph.despawn(gone);
        assert_eq!(graph.add(a, gone), Err(GraphError::UnknownEntity(gone)));
    }

    #[test]
    fn test_world_matrix_of_child() {
        let mut graph = EntityGraph::new();
        let root = at(&mut graph, 1.0, 1.0, 1.0);
        let child = at(&mut graph, 0.0, 0.0, 1.0);
        graph.add(root, child).unwrap();

        graph.update_world_matrix(root, false, false);
        graph.update_world_matrix(child, false, false);

        assert_eq!(
            graph.get(root).unwrap().world_matrix().as_slice(),
            &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0]
        );
        assert_eq!(
            graph.get(child).unwrap().world_matrix().as_slice(),
            &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 2.0, 1.0]
        );
    }

    #[test]
    fn test_world_matrix_traverses_up_and_down() {
        let mut graph = EntityGraph::new();
        let a = at(&mut graph, 1.0, 1.0, 1.0);
        let b = at(&mut graph, 0.0, 0.0, 1.0);
        let c = at(&mut graph, 0.0, 1.0, 0.0);
        graph.add(a, b).unwrap();
        graph.add(b, c).unwrap();

        graph.update_world_matrix(b, true, true);

        let translation = |key| extract_translation(graph.get(key).unwrap().world_matrix());
        assert_eq!(translation(a), Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(translation(b), Vec3::new(1.0, 1.0, 2.0));
        assert_eq!(translation(c), Vec3::new(1.0, 2.0, 2.0));
    }

    #[test]
    fn test_root_world_equals_local() {
        let mut graph = EntityGraph::new();
        let root = graph.spawn(GameEntity::new().with_scale(Vec3::new(2.0, 3.0, 4.0)));
        graph.update_world_matrix(root, false, false);
        let entity = graph.get(root).unwrap();
        assert_eq!(entity.world_matrix(), entity.local_matrix());
    }

    #[test]
    fn test_world_position_under_rotated_parent() {
        let mut graph = EntityGraph::new();
        let parent = graph.spawn(
            GameEntity::new()
                .with_position(Vec3::new(1.0, 0.0, 0.0))
                .with_rotation(crate::foundation::math::Quat::from_axis_angle(&Vec3::y_axis(), std::f32::consts::FRAC_PI_2)),
        );
        let child = at(&mut graph, 0.0, 0.0, 1.0);
        graph.add(parent, child).unwrap();
        graph.update_world_matrices();

        assert_relative_eq!(graph.get(child).unwrap().get_world_position(), Vec3::new(2.0, 0.0, 0.0), epsilon = 1e-5);
        assert_relative_eq!(graph.get(child).unwrap().get_world_direction(), Vec3::new(1.0, 0.0, 0.0), epsilon = 1e-5);
    }

    #[test]
    fn test_render_sync_runs_on_refresh() {
        #[derive(Default)]
        struct Mesh {
            position: Vec3,
            syncs: u32,
        }

        let mut graph = EntityGraph::new();
        let key = at(&mut graph, 3.0, 0.0, 0.0);
        graph.set_render_component(key, Mesh::default(), |entity, mesh: &mut Mesh| {
            mesh.position = entity.get_world_position();
            mesh.syncs += 1;
        });

        graph.update_world_matrix(key, false, false);
        let mesh = graph.render_component::<Mesh>(key).unwrap();
        assert_eq!(mesh.position, Vec3::new(3.0, 0.0, 0.0));
        assert_eq!(mesh.syncs, 1);

        graph.clear_render_component(key);
        graph.update_world_matrix(key, false, false);
        assert!(graph.render_component::<Mesh>(key).is_none());
    }

    #[test]
    fn test_start_runs_once() {
        struct Counter(Rc<Cell<u32>>);
        impl EntityBehavior for Counter {
            fn start(&mut self, _entity: &mut GameEntity) {
                self.0.set(self.0.get() + 1);
            }
        }

        let starts = Rc::new(Cell::new(0));
        let mut graph = EntityGraph::new();
        let key = graph.spawn_with_behavior(GameEntity::new(), Counter(starts.clone()));

        assert!(graph.start(key));
        assert!(!graph.start(key));
        assert_eq!(starts.get(), 1);
        assert!(graph.get(key).unwrap().is_started());
    }

    #[test]
    fn test_default_hooks() {
        let mut graph = EntityGraph::new();
        let sender = at(&mut graph, 0.0, 0.0, 0.0);
        let receiver = at(&mut graph, 0.0, 0.0, 0.0);
        let before = graph.get(receiver).unwrap().clone();

        let telegram = Telegram::new(sender, receiver, "hello", 0.0, None);
        assert!(!graph.handle_message(receiver, &telegram));
        assert_eq!(graph.get(receiver).unwrap(), &before);

        let ray = Ray::new(Vec3::zeros(), Vec3::z());
        assert_eq!(graph.line_of_sight_test(receiver, &ray), None);
    }

    #[test]
    fn test_blocking_hook() {
        struct Wall;
        impl EntityBehavior for Wall {
            fn line_of_sight_test(&self, _entity: &GameEntity, ray: &Ray) -> Option<Vec3> {
                Some(ray.origin)
            }
        }

        let mut graph = EntityGraph::new();
        let wall = graph.spawn_with_behavior(GameEntity::new(), Wall);
        let ray = Ray::new(Vec3::zeros(), Vec3::z());
        assert_eq!(graph.line_of_sight_test(wall, &ray), Some(Vec3::zeros()));
    }

    #[test]
    fn test_despawn_releases_subtree() {
        let mut graph = EntityGraph::new();
        let root = at(&mut graph, 0.0, 0.0, 0.0);
        let child = at(&mut graph, 0.0, 0.0, 0.0);
        let grandchild = at(&mut graph, 0.0, 0.0, 0.0);
        let observer = at(&mut graph, 0.0, 0.0, 0.0);
        graph.add(root, child).unwrap();
        graph.add(child, grandchild).unwrap();
        graph.get_mut(observer).unwrap().neighbors = vec![grandchild, root];

        let grandchild_id = graph.get(grandchild).unwrap().id().clone();
        assert_eq!(graph.despawn(child), 2);

        assert!(!graph.contains(grandchild));
        assert!(graph.get(root).unwrap().children().is_empty());
        assert_eq!(graph.get(observer).unwrap().neighbors, vec![root]);
        assert!(graph.key_of(&grandchild_id).is_none());
        assert_eq!(graph.despawn(child), 0);
    }
}
