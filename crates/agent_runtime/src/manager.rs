//! Entity manager and message dispatch
//!
//! The manager owns the [`EntityGraph`], tracks which entities are
//! registered for simulation and routes [`Telegram`]s between them.
//!
//! Per tick, for every registered active entity and its active descendants:
//!
//! 1. refresh `neighbors` if `update_neighborhood` is set
//! 2. run `start` once, then `update(delta)`
//!
//! followed by a world-matrix refresh of each registered subtree and the
//! delivery of due delayed telegrams.

use std::collections::HashSet;

use crate::entity::{EntityKey, ManagerId, MessageData, Telegram};
use crate::graph::EntityGraph;

/// Immediate and delayed telegram delivery
#[derive(Debug, Default)]
pub struct MessageDispatcher {
    delayed: Vec<Telegram>,
}

impl MessageDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver now (delay <= 0) or queue for later
    ///
    /// Returns whether the receiver handled the message; queued telegrams
    /// always report `false`.
    pub fn dispatch(&mut self, graph: &mut EntityGraph, telegram: Telegram) -> bool {
        if telegram.delay <= 0.0 {
            Self::deliver(graph, &telegram)
        } else {
            log::trace!("Queued '{}' for {:.3}s", telegram.message, telegram.delay);
            self.delayed.push(telegram);
            false
        }
    }

    /// Count queued delays down by `delta` seconds and deliver the due ones
    /// in queue order
    pub fn dispatch_delayed(&mut self, graph: &mut EntityGraph, delta: f64) {
        let mut due = Vec::new();
        self.delayed.retain_mut(|telegram| {
            telegram.delay -= delta;
            if telegram.delay <= 0.0 {
                due.push(telegram.clone());
                false
            } else {
                true
            }
        });

        for telegram in &due {
            Self::deliver(graph, telegram);
        }
    }

    /// Drop every queued telegram
    pub fn clear(&mut self) {
        self.delayed.clear();
    }

    /// Number of queued telegrams
    pub fn pending(&self) -> usize {
        self.delayed.len()
    }

    fn deliver(graph: &mut EntityGraph, telegram: &Telegram) -> bool {
        let handled = graph.handle_message(telegram.receiver, telegram);
        if !handled {
            log::warn!("Message '{}' not handled by {:?}", telegram.message, telegram.receiver);
        }
        handled
    }
}

/// Registry that drives entities through their lifecycle
#[derive(Debug)]
pub struct EntityManager {
    id: ManagerId,
    graph: EntityGraph,
    registered: Vec<EntityKey>,
    dispatcher: MessageDispatcher,
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityManager {
    /// Create a manager with an empty graph
    pub fn new() -> Self {
        Self::with_graph(EntityGraph::new())
    }

    /// Create a manager around an existing graph, e.g. a restored snapshot
    pub fn with_graph(graph: EntityGraph) -> Self {
        Self {
            id: ManagerId::next(),
            graph,
            registered: Vec::new(),
            dispatcher: MessageDispatcher::new(),
        }
    }

    /// This manager's identity
    pub fn id(&self) -> ManagerId {
        self.id
    }

    /// The owned graph
    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    /// The owned graph, mutably
    pub fn graph_mut(&mut self) -> &mut EntityGraph {
        &mut self.graph
    }

    /// The dispatcher
    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// Registered entities in registration order
    pub fn registered(&self) -> &[EntityKey] {
        &self.registered
    }

    /// Register an entity for simulation
    ///
    /// Returns `false` for unknown or already registered keys.
    pub fn register(&mut self, key: EntityKey) -> bool {
        let Some(entity) = self.graph.get_mut(key) else {
            log::warn!("Cannot register unknown entity {:?}", key);
            return false;
        };
        if self.registered.contains(&key) {
            return false;
        }
        entity.set_manager(Some(self.id));
        self.registered.push(key);
        log::debug!("Registered entity {:?}", key);
        true
    }

    /// Stop simulating an entity; it stays in the graph
    pub fn unregister(&mut self, key: EntityKey) -> bool {
        let Some(index) = self.registered.iter().position(|k| *k == key) else {
            return false;
        };
        self.registered.remove(index);
        if let Some(entity) = self.graph.get_mut(key) {
            entity.set_manager(None);
        }
        true
    }

    /// Unregister and destroy an entity together with its subtree
    pub fn despawn(&mut self, key: EntityKey) -> usize {
        let subtree = self.subtree(key, false);
        self.registered.retain(|k| !subtree.contains(k));
        self.graph.despawn(key)
    }

    /// Keys of `root` and its descendants, depth first
    fn subtree(&self, root: EntityKey, active_only: bool) -> Vec<EntityKey> {
        let mut keys = Vec::new();
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(key) = stack.pop() {
            let Some(entity) = self.graph.get(key) else {
                continue;
            };
            if !seen.insert(key) || (active_only && !entity.active) {
                continue;
            }
            keys.push(key);
            stack.extend(entity.children().iter().rev().copied());
        }
        keys
    }

    /// Advance every registered entity by `delta` seconds
    pub fn update(&mut self, delta: f64) {
        self.registered.retain(|key| self.graph.contains(*key));

        let mut visited = HashSet::new();
        for root in self.registered.clone() {
            for key in self.subtree(root, true) {
                if !visited.insert(key) {
                    continue;
                }
                if self.graph.get(key).is_some_and(|e| e.update_neighborhood) {
                    self.update_neighborhood(key);
                }
                self.graph.start(key);
                self.graph.update(key, delta);
            }
        }

        let registered: HashSet<EntityKey> = self.registered.iter().copied().collect();
        for key in self.registered.clone() {
            let parent_registered = self
                .graph
                .get(key)
                .and_then(|e| e.parent())
                .is_some_and(|parent| registered.contains(&parent));
            if !parent_registered {
                self.graph.update_world_matrix(key, true, true);
            }
        }

        self.dispatcher.dispatch_delayed(&mut self.graph, delta);
    }

    /// Replace `neighbors` of `key` with the registered active entities
    /// inside its neighborhood radius
    pub fn update_neighborhood(&mut self, key: EntityKey) {
        let Some(entity) = self.graph.get(key) else {
            return;
        };
        let center = entity.position;
        let radius_squared = entity.neighborhood_radius * entity.neighborhood_radius;

        let neighbors: Vec<EntityKey> = self
            .registered
            .iter()
            .copied()
            .filter(|candidate| *candidate != key)
            .filter(|candidate| {
                self.graph
                    .get(*candidate)
                    .is_some_and(|other| other.active && (other.position - center).norm_squared() <= radius_squared)
            })
            .collect();

        if let Some(entity) = self.graph.get_mut(key) {
            entity.neighbors = neighbors;
        }
    }

    /// Send a message from `sender` to `receiver`
    ///
    /// The sender must be registered with this manager. Returns whether the
    /// message was handled immediately.
    pub fn send_message(
        &mut self,
        sender: EntityKey,
        receiver: EntityKey,
        message: impl Into<String>,
        delay: f64,
        data: Option<MessageData>,
    ) -> bool {
        let message = message.into();
        let manager = self.graph.get(sender).and_then(|e| e.manager());
        if manager != Some(self.id) {
            log::error!("Entity {:?} is not registered with a manager, cannot send '{}'", sender, message);
            return false;
        }
        self.dispatcher
            .dispatch(&mut self.graph, Telegram::new(sender, receiver, message, delay, data))
    }

    /// Drop every queued telegram
    pub fn clear_messages(&mut self) {
        self.dispatcher.clear();
    }
}
