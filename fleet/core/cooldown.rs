use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Default interval between state-changing operations on one instance.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Source of monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

/// Rejection returned when an instance is still cooling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownActive {
    /// Time left until the gate opens again.
    pub remaining: Duration,
}

/// Per-instance rate limiter keyed by unique instance id.
///
/// Cloning is cheap and clones share state.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    window: Duration,
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

impl CooldownGate {
    /// Gate with the given window on the system clock.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, Arc::new(SystemClock))
    }

    /// Gate with the given window and clock.
    #[must_use]
    pub fn with_clock(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Configured window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// True iff less than the window has elapsed since the last action on `id`.
    #[must_use]
    pub fn is_cooling(&self, id: &str) -> bool {
        self.remaining(id).is_some()
    }

    /// Time left on the cooldown for `id`, if any.
    #[must_use]
    pub fn remaining(&self, id: &str) -> Option<Duration> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        entries.get(id).and_then(|last| self.remaining_since(*last, now))
    }

    /// Marks `id` as acted upon now.
    pub fn record(&self, id: &str) {
        let now = self.clock.now();
        self.entries.lock().insert(id.to_string(), now);
    }

    /// Atomically checks the gate and records an action.
    ///
    /// The returned claim keeps the new timestamp when committed. Dropping it
    /// uncommitted restores the previous timestamp, so a failed operation does
    /// not start a cooldown.
    pub fn try_claim(&self, id: &str) -> Result<CooldownClaim, CooldownActive> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let previous = entries.get(id).copied();
        if let Some(remaining) = previous.and_then(|last| self.remaining_since(last, now)) {
            return Err(CooldownActive { remaining });
        }
        entries.insert(id.to_string(), now);
        Ok(CooldownClaim {
            gate: self.clone(),
            id: id.to_string(),
            stamped: now,
            previous,
            committed: false,
        })
    }

    fn remaining_since(&self, last: Instant, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.window).then(|| self.window - elapsed)
    }
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

/// Reservation handed out by [`CooldownGate::try_claim`].
#[derive(Debug)]
#[must_use = "dropping a claim without committing it releases the cooldown"]
pub struct CooldownClaim {
    gate: CooldownGate,
    id: String,
    stamped: Instant,
    previous: Option<Instant>,
    committed: bool,
}

impl CooldownClaim {
    /// Keeps the cooldown started by this claim.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for CooldownClaim {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut entries = self.gate.entries.lock();
        // Leave the entry alone if someone recorded a newer action meanwhile.
        if entries.get(&self.id) == Some(&self.stamped) {
            match self.previous {
                Some(previous) => {
                    entries.insert(self.id.clone(), previous);
                }
                None => {
                    entries.remove(&self.id);
                }
            }
        }
    }
}
