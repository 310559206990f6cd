//! Epoch clock: derives the committee epoch and slot from wall-clock time,
//! and a watcher task that announces each new epoch to subscribers.
//!
//! Nothing here reads ambient state. Every consumer is handed an explicit
//! [`Epoch`] so tests can drive time with a [`ManualClock`].

use crate::error::{DefenseError, DefenseResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::{sync::broadcast, task::JoinHandle, time};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochInfo {
    pub epoch: Epoch,
    pub slot: u64,
    pub slot_in_epoch: u32,
    /// Slots left in this epoch, counting the current one.
    pub slots_remaining: u32,
}

/// Wall-clock source, in time elapsed since the unix epoch.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
    }
}

/// Hand-driven clock for tests and offline simulation.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self { millis: Arc::new(AtomicU64::new(start.as_millis() as u64)) }
    }

    pub fn set(&self, at: Duration) {
        self.millis.store(at.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochClock {
    genesis: Duration,
    slot_duration: Duration,
    slots_per_epoch: u64,
}

impl EpochClock {
    /// Zero slot duration or zero slots per epoch is a startup configuration error.
    pub fn new(genesis: Duration, slot_duration: Duration, slots_per_epoch: u64) -> DefenseResult<Self> {
        if slot_duration.is_zero() {
            return Err(DefenseError::Configuration("slot duration must be non-zero".into()));
        }
        if slots_per_epoch == 0 {
            return Err(DefenseError::Configuration("slots per epoch must be non-zero".into()));
        }
        Ok(Self { genesis, slot_duration, slots_per_epoch })
    }

    /// Mainnet constants: genesis 2020-12-01 12:00:23 UTC, 12 s slots, 32 slots per epoch.
    pub fn mainnet() -> Self {
        Self {
            genesis: Duration::from_secs(1_606_824_023),
            slot_duration: Duration::from_secs(12),
            slots_per_epoch: 32,
        }
    }

    pub fn slot_duration(&self) -> Duration {
        self.slot_duration
    }

    pub fn slots_per_epoch(&self) -> u64 {
        self.slots_per_epoch
    }

    pub fn epoch_duration(&self) -> Duration {
        self.slot_duration.saturating_mul(self.slots_per_epoch as u32)
    }

    /// Pure function of `now`. Times before genesis map to epoch 0, slot 0.
    pub fn current_epoch_info(&self, now: Duration) -> EpochInfo {
        let elapsed = now.saturating_sub(self.genesis);
        let slot = (elapsed.as_nanos() / self.slot_duration.as_nanos()) as u64;
        let slot_in_epoch = slot % self.slots_per_epoch;
        EpochInfo {
            epoch: Epoch(slot / self.slots_per_epoch),
            slot,
            slot_in_epoch: slot_in_epoch as u32,
            slots_remaining: (self.slots_per_epoch - slot_in_epoch) as u32,
        }
    }

    pub fn epoch_at(&self, now: Duration) -> Epoch {
        self.current_epoch_info(now).epoch
    }

    /// Start of the given epoch, in time since the unix epoch.
    pub fn epoch_start(&self, epoch: Epoch) -> Duration {
        let slots = epoch.0.saturating_mul(self.slots_per_epoch);
        self.genesis + self.slot_duration.saturating_mul(slots.min(u32::MAX as u64) as u32)
    }

    pub fn time_until_next_epoch(&self, now: Duration) -> Duration {
        let next = self.epoch_at(now).next();
        self.epoch_start(next).saturating_sub(now)
    }
}

/// Polls the clock at a bounded interval and broadcasts each epoch exactly once.
pub struct EpochWatcher {
    clock: EpochClock,
    time: Arc<dyn TimeSource>,
    poll: Duration,
    tx: broadcast::Sender<Epoch>,
}

impl EpochWatcher {
    pub fn new(clock: EpochClock, time: Arc<dyn TimeSource>, poll: Duration) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { clock, time, poll, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Epoch> {
        self.tx.subscribe()
    }

    /// Start the polling task. It stops when `shutdown` fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.poll);
            let mut last: Option<Epoch> = None;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("🛑 Epoch watcher stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let info = self.clock.current_epoch_info(self.time.now());
                        if last.map_or(true, |e| info.epoch > e) {
                            debug!("⏱️  Epoch {} (slot {}, {} slots remaining)", info.epoch, info.slot, info.slots_remaining);
                            last = Some(info.epoch);
                            let _ = self.tx.send(info.epoch);
                        }
                    }
                }
            }
        })
    }
}
