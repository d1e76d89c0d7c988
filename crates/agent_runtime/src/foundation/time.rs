//! Time management utilities
//!
//! [`SimulationClock`] turns a monotonic time source into per-tick deltas.
//! Internally everything is kept in milliseconds; the public accessors speak
//! seconds.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use crate::core::config::SimulationConfig;

/// Default fixed delta in milliseconds (roughly 60 FPS)
pub const DEFAULT_FIXED_DELTA_MS: f64 = 16.67;

/// Monotonic clock the simulation reads "now" from
pub trait TimeSource {
    /// Milliseconds since an arbitrary, fixed origin
    fn now_ms(&self) -> f64;
}

/// [`TimeSource`] backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicSource {
    origin: Instant,
}

impl Default for MonotonicSource {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl TimeSource for MonotonicSource {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Host visibility state reported by a [`VisibilitySignal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// The host window/tab is in the foreground
    Visible,
    /// The host was backgrounded or lost focus
    Hidden,
}

/// Identifier handed out by [`VisibilitySignal::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Callback invoked on every visibility transition
pub type VisibilityListener = Box<dyn FnMut(Visibility)>;

/// Host-provided source of focus-lost / focus-regained events
pub trait VisibilitySignal {
    /// Register a listener. Returns `None` when the host has no such signal.
    fn subscribe(&mut self, listener: VisibilityListener) -> Option<ListenerId>;

    /// Remove a previously registered listener
    fn unsubscribe(&mut self, id: ListenerId);
}

/// Frame clock for the simulation
///
/// Produces the delta between two `update` calls and the accumulated elapsed
/// time. In fixed-delta mode every tick reports the configured step, which
/// makes playback reproducible.
///
/// `timescale` scales both; `0` freezes simulated time, a negative value makes
/// `elapsed` run backwards. Callers that need a monotonic elapsed value must
/// clamp the timescale themselves.
pub struct SimulationClock {
    source: Rc<dyn TimeSource>,
    previous_time: f64,
    current_time: f64,
    delta: f64,
    elapsed: f64,
    timescale: f64,
    use_fixed_delta: bool,
    fixed_delta: f64,
    resumed_at: Rc<Cell<Option<f64>>>,
    listener: Option<ListenerId>,
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulationClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationClock")
            .field("current_time", &self.current_time)
            .field("delta", &self.delta)
            .field("elapsed", &self.elapsed)
            .field("timescale", &self.timescale)
            .field("use_fixed_delta", &self.use_fixed_delta)
            .field("fixed_delta", &self.fixed_delta)
            .finish_non_exhaustive()
    }
}

impl SimulationClock {
    /// Create a clock reading from [`Instant`]
    pub fn new() -> Self {
        Self::with_time_source(Rc::new(MonotonicSource::default()))
    }

    /// Create a clock reading from a custom time source
    pub fn with_time_source(source: Rc<dyn TimeSource>) -> Self {
        let now = source.now_ms();
        Self {
            source,
            previous_time: now,
            current_time: now,
            delta: 0.0,
            elapsed: 0.0,
            timescale: 1.0,
            use_fixed_delta: false,
            fixed_delta: DEFAULT_FIXED_DELTA_MS,
            resumed_at: Rc::new(Cell::new(None)),
            listener: None,
        }
    }

    /// Create a clock configured from a [`SimulationConfig`]
    pub fn from_config(config: &SimulationConfig) -> Self {
        let mut clock = Self::new();
        clock
            .set_fixed_delta(config.fixed_delta)
            .set_timescale(config.timescale);
        clock.use_fixed_delta = config.use_fixed_delta;
        clock
    }

    /// Resync the clock to "now" so the next delta starts from here
    pub fn reset(&mut self) -> &mut Self {
        self.current_time = self.source.now_ms();
        self.resumed_at.set(None);
        self
    }

    /// Advance the clock by one tick (call once per frame)
    pub fn update(&mut self) -> &mut Self {
        if let Some(resumed) = self.resumed_at.take() {
            self.current_time = resumed;
        }

        if self.use_fixed_delta {
            self.delta = self.fixed_delta;
        } else {
            self.previous_time = self.current_time;
            self.current_time = self.source.now_ms();
            self.delta = self.current_time - self.previous_time;
        }

        self.delta *= self.timescale;
        self.elapsed += self.delta;
        self
    }

    /// Time covered by the last tick, in seconds
    pub fn delta(&self) -> f64 {
        self.delta / 1000.0
    }

    /// Sum of all deltas so far, in seconds
    pub fn elapsed(&self) -> f64 {
        self.elapsed / 1000.0
    }

    /// Fixed step in seconds
    pub fn fixed_delta(&self) -> f64 {
        self.fixed_delta / 1000.0
    }

    /// Set the fixed step in seconds
    pub fn set_fixed_delta(&mut self, seconds: f64) -> &mut Self {
        self.fixed_delta = seconds * 1000.0;
        self
    }

    /// Current timescale multiplier
    pub fn timescale(&self) -> f64 {
        self.timescale
    }

    /// Set the rate at which simulated time passes
    pub fn set_timescale(&mut self, timescale: f64) -> &mut Self {
        self.timescale = timescale;
        self
    }

    /// Report the fixed step instead of measured wall-clock time
    pub fn enable_fixed_delta(&mut self) -> &mut Self {
        self.use_fixed_delta = true;
        self
    }

    /// Go back to measured wall-clock deltas
    pub fn disable_fixed_delta(&mut self) -> &mut Self {
        self.use_fixed_delta = false;
        self
    }

    /// Whether fixed-delta mode is on
    pub fn uses_fixed_delta(&self) -> bool {
        self.use_fixed_delta
    }

    /// Feed a visibility transition by hand
    ///
    /// Becoming visible resets the clock; becoming hidden does nothing.
    pub fn handle_visibility_change(&mut self, visibility: Visibility) {
        if visibility == Visibility::Visible {
            self.reset();
        }
    }

    /// Listen to a host visibility signal so a long background pause does not
    /// surface as one huge delta
    ///
    /// The resume instant is captured when the signal fires and applied on
    /// the next [`update`](Self::update). A host without the signal leaves
    /// the clock untouched.
    pub fn attach_visibility(&mut self, signal: &mut dyn VisibilitySignal) {
        if self.listener.is_some() {
            log::debug!("Visibility listener already attached");
            return;
        }

        let source = Rc::clone(&self.source);
        let resumed_at = Rc::clone(&self.resumed_at);
        self.listener = signal.subscribe(Box::new(move |visibility| {
            if visibility == Visibility::Visible {
                resumed_at.set(Some(source.now_ms()));
            }
        }));

        if self.listener.is_none() {
            log::debug!("Host has no visibility signal, pause-on-hidden disabled");
        }
    }

    /// Detach from the visibility signal; safe to call repeatedly
    pub fn dispose(&mut self, signal: &mut dyn VisibilitySignal) {
        if let Some(id) = self.listener.take() {
            signal.unsubscribe(id);
        }
    }

    /// Whether a visibility listener is currently registered
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[derive(Default)]
    struct ManualSource {
        now: Cell<f64>,
    }

    impl ManualSource {
        fn advance(&self, ms: f64) {
            self.now.set(self.now.get() + ms);
        }
    }

    impl TimeSource for ManualSource {
        fn now_ms(&self) -> f64 {
            self.now.get()
        }
    }

    #[derive(Default)]
    struct FakeSignal {
        listeners: Vec<(ListenerId, VisibilityListener)>,
        next_id: u64,
    }

    impl FakeSignal {
        fn fire(&mut self, visibility: Visibility) {
            for (_, listener) in &mut self.listeners {
                listener(visibility);
            }
        }
    }

    impl VisibilitySignal for FakeSignal {
        fn subscribe(&mut self, listener: VisibilityListener) -> Option<ListenerId> {
            let id = ListenerId(self.next_id);
            self.next_id += 1;
            self.listeners.push((id, listener));
            Some(id)
        }

        fn unsubscribe(&mut self, id: ListenerId) {
            self.listeners.retain(|(existing, _)| *existing != id);
        }
    }

    struct NoSignal;

    impl VisibilitySignal for NoSignal {
        fn subscribe(&mut self, _listener: VisibilityListener) -> Option<ListenerId> {
            None
        }

        fn unsubscribe(&mut self, _id: ListenerId) {
            panic!("nothing was ever subscribed");
        }
    }

    fn manual_clock() -> (Rc<ManualSource>, SimulationClock) {
        let source = Rc::new(ManualSource::default());
        let clock = SimulationClock::with_time_source(source.clone());
        (source, clock)
    }

    #[test]
    fn test_defaults() {
        let clock = SimulationClock::new();
        assert_eq!(clock.delta(), 0.0);
        assert_eq!(clock.elapsed(), 0.0);
        assert_eq!(clock.timescale(), 1.0);
        assert!(!clock.uses_fixed_delta());
        assert_relative_eq!(clock.fixed_delta(), 0.01667, epsilon = 1e-9);
    }

    #[test]
    fn test_wall_clock_deltas() {
        let (source, mut clock) = manual_clock();

        source.advance(40.0);
        clock.update();
        assert_relative_eq!(clock.delta(), 0.04);

        source.advance(10.0);
        clock.update();
        assert_relative_eq!(clock.delta(), 0.01);
        assert_relative_eq!(clock.elapsed(), 0.05);
    }

    #[test]
    fn test_fixed_step_with_timescale() {
        let mut clock = SimulationClock::new();
        clock.set_fixed_delta(1.0).set_timescale(2.0).enable_fixed_delta();

        clock.update();
        assert_relative_eq!(clock.delta(), 2.0);
        assert_relative_eq!(clock.elapsed(), 2.0);

        clock.update();
        assert_relative_eq!(clock.delta(), 2.0);
        assert_relative_eq!(clock.elapsed(), 4.0);

        clock.set_timescale(0.5);
        clock.update();
        assert_relative_eq!(clock.delta(), 0.5);
        assert_relative_eq!(clock.elapsed(), 4.5);
    }

    #[test]
    fn test_zero_timescale_freezes_elapsed() {
        let (source, mut clock) = manual_clock();
        clock.set_timescale(0.0);
        source.advance(100.0);
        clock.update();
        assert_eq!(clock.delta(), 0.0);
        assert_eq!(clock.elapsed(), 0.0);
    }

    #[test]
    fn test_negative_timescale_runs_backwards() {
        let mut clock = SimulationClock::new();
        clock.set_fixed_delta(1.0).set_timescale(-1.0).enable_fixed_delta();
        clock.update();
        assert_relative_eq!(clock.elapsed(), -1.0);
    }

    #[test]
    fn test_reset_swallows_paused_time() {
        let (source, mut clock) = manual_clock();
        source.advance(5_000.0);
        clock.reset();
        source.advance(16.0);
        clock.update();
        assert_relative_eq!(clock.delta(), 0.016);
    }

    #[test]
    fn test_visibility_resume_resets() {
        let (source, mut clock) = manual_clock();
        let mut signal = FakeSignal::default();
        clock.attach_visibility(&mut signal);
        assert!(clock.is_listening());

        signal.fire(Visibility::Hidden);
        source.advance(10_000.0);
        signal.fire(Visibility::Visible);
        source.advance(20.0);

        clock.update();
        assert_relative_eq!(clock.delta(), 0.02);
    }

    #[test]
    fn test_hidden_does_not_reset() {
        let (source, mut clock) = manual_clock();
        let mut signal = FakeSignal::default();
        clock.attach_visibility(&mut signal);

        source.advance(3_000.0);
        signal.fire(Visibility::Hidden);
        clock.update();
        assert_relative_eq!(clock.delta(), 3.0);
    }

    #[test]
    fn test_manual_visibility_forwarding() {
        let (source, mut clock) = manual_clock();
        source.advance(1_000.0);
        clock.handle_visibility_change(Visibility::Hidden);
        clock.handle_visibility_change(Visibility::Visible);
        source.advance(5.0);
        clock.update();
        assert_relative_eq!(clock.delta(), 0.005);
    }

    #[test]
    fn test_dispose_unregisters_once() {
        let mut clock = SimulationClock::new();
        let mut signal = FakeSignal::default();
        clock.attach_visibility(&mut signal);
        assert_eq!(signal.listeners.len(), 1);

        clock.dispose(&mut signal);
        assert!(signal.listeners.is_empty());
        clock.dispose(&mut signal);
        assert!(!clock.is_listening());
    }

    #[test]
    fn test_missing_signal_is_noop() {
        let mut clock = SimulationClock::new();
        let mut signal = NoSignal;
        clock.attach_visibility(&mut signal);
        assert!(!clock.is_listening());
        clock.dispose(&mut signal);
    }
}
