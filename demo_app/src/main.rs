//! Patrol demo
//!
//! A guard walks between waypoints while a lookout tower turns to track it.
//! When the guard reaches a waypoint it radios the tower, which answers
//! after a short delay. The final state is written out as a RON snapshot.
//!
//! Usage: `patrol_demo [config.toml|config.ron] [snapshot.ron]`

use std::cell::RefCell;
use std::rc::Rc;

use agent_runtime::foundation::logging;
use agent_runtime::prelude::*;

/// Number of simulated ticks
const TICKS: usize = 600;

#[derive(thiserror::Error, Debug)]
enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Shared view of where the guard currently is
type GuardPosition = Rc<RefCell<Vec3>>;

struct Guard {
    waypoints: Vec<Vec3>,
    next: usize,
    speed: f32,
    position: GuardPosition,
    arrivals: Rc<RefCell<Vec<usize>>>,
}

impl EntityBehavior for Guard {
    fn start(&mut self, entity: &mut GameEntity) {
        log::info!("Guard '{}' starts patrol at {:?}", entity.name, entity.position);
    }

    fn update(&mut self, entity: &mut GameEntity, delta: f64) {
        let target = self.waypoints[self.next];
        let offset = target - entity.position;
        let step = self.speed * delta as f32;

        if offset.norm() <= step {
            entity.position = target;
            self.arrivals.borrow_mut().push(self.next);
            self.next = (self.next + 1) % self.waypoints.len();
        } else {
            entity.position += offset.normalize() * step;
            entity.look_at(&target);
        }
        *self.position.borrow_mut() = entity.position;
    }

    fn handle_message(&mut self, entity: &mut GameEntity, telegram: &Telegram) -> bool {
        log::info!("Guard '{}' got '{}'", entity.name, telegram.message);
        telegram.message == "acknowledged"
    }
}

struct Tower {
    guard: GuardPosition,
    tolerance: f32,
}

impl EntityBehavior for Tower {
    fn update(&mut self, entity: &mut GameEntity, delta: f64) {
        let target = *self.guard.borrow();
        entity.rotate_to(&target, delta as f32, self.tolerance);
    }

    fn handle_message(&mut self, entity: &mut GameEntity, telegram: &Telegram) -> bool {
        if telegram.message != "checkpoint" {
            return false;
        }
        log::info!("Tower '{}' logged checkpoint {:?}", entity.name, telegram.data);
        true
    }

    fn line_of_sight_test(&self, entity: &GameEntity, ray: &Ray) -> Option<Vec3> {
        // solid sphere around the tower
        let to_center = entity.get_world_position() - ray.origin;
        let along = to_center.dot(&ray.direction);
        let closest = to_center.norm_squared() - along * along;
        let radius = entity.bounding_radius;
        if along < 0.0 || closest > radius * radius {
            return None;
        }
        Some(ray.at(along - (radius * radius - closest).sqrt()))
    }
}

fn run() -> Result<(), DemoError> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "patrol.toml".to_string());
    let snapshot_path = args.next().unwrap_or_else(|| "patrol_snapshot.ron".to_string());

    let config = SimulationConfig::load_or_default(&config_path)?;
    config.validate()?;
    logging::init_with_level(&config.log_level);
    log::info!("Simulation config: {:?}", config);

    let mut clock = SimulationClock::from_config(&config);
    if !clock.uses_fixed_delta() {
        log::warn!("Demo runs faster than real time, forcing fixed step");
        clock.enable_fixed_delta();
    }

    let mut manager = EntityManager::new();
    let guard_position: GuardPosition = Rc::new(RefCell::new(Vec3::zeros()));
    let arrivals = Rc::new(RefCell::new(Vec::new()));

    let outpost = manager.graph_mut().spawn(GameEntity::new().with_name("outpost"));
    let guard = manager.graph_mut().spawn_with_behavior(
        GameEntity::new().with_name("guard"),
        Guard {
            waypoints: vec![Vec3::new(4.0, 0.0, 0.0), Vec3::new(4.0, 0.0, 4.0), Vec3::new(0.0, 0.0, 4.0), Vec3::zeros()],
            next: 0,
            speed: 2.0,
            position: guard_position.clone(),
            arrivals: arrivals.clone(),
        },
    );
    let tower = manager.graph_mut().spawn_with_behavior(
        GameEntity::new().with_name("tower").with_position(Vec3::new(2.0, 0.0, 2.0)),
        Tower {
            guard: guard_position,
            tolerance: config.turn_tolerance,
        },
    );
    {
        let graph = manager.graph_mut();
        if let Some(entity) = graph.get_mut(tower) {
            entity.bounding_radius = 0.5;
            entity.max_turn_rate = std::f32::consts::FRAC_PI_2;
        }
        if let Some(entity) = graph.get_mut(guard) {
            entity.update_neighborhood = true;
            entity.neighborhood_radius = 2.5;
        }
        if let Err(e) = graph.add(outpost, tower) {
            log::error!("Could not attach tower: {}", e);
        }
    }
    manager.register(outpost);
    manager.register(guard);

    let mut reported = 0;
    for tick in 0..TICKS {
        clock.update();
        manager.update(clock.delta());

        let arrived: Vec<usize> = arrivals.borrow()[reported..].to_vec();
        reported += arrived.len();
        for waypoint in arrived {
            let data = ron::Value::Number(ron::Number::Integer(waypoint as i64));
            manager.send_message(guard, tower, "checkpoint", 0.0, Some(data));
            manager.send_message(guard, guard, "acknowledged", 0.5, None);
        }

        if tick % 120 == 0 {
            if let Some(entity) = manager.graph().get(guard) {
                log::debug!(
                    "t={:.2}s guard at {:?}, {} neighbors",
                    clock.elapsed(),
                    entity.get_world_position(),
                    entity.neighbors.len()
                );
            }
        }
    }

    let ray = Ray::new(Vec3::new(2.0, 0.0, -3.0), Vec3::new(0.0, 0.0, 1.0));
    match manager.graph().line_of_sight_test(tower, &ray) {
        Some(hit) => log::info!("Line of sight blocked by tower at {:?}", hit),
        None => log::info!("Line of sight clear"),
    }

    GraphSnapshot::capture(manager.graph()).save(&snapshot_path)?;
    log::info!(
        "Simulated {:.2}s, {} checkpoints, snapshot written to {}",
        clock.elapsed(),
        reported,
        snapshot_path
    );
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        logging::init_with_level("error");
        log::error!("Patrol demo failed: {}", e);
        std::process::exit(1);
    }
}
