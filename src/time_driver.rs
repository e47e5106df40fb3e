//! Speed-scaled virtual clock registered as the `embassy-time` driver.
//!
//! Virtual time advances at `speed_percent`% of wall-clock time, so a 10 s
//! localization run at 1000 % finishes in about one real second while every
//! protocol timer still sees its nominal durations.
//!
//! - `ClockMapping` converts between wall-clock instants and virtual ticks
//! - a background scheduler thread wakes timers whose virtual deadline passed
//! - `set_simulation_speed_percent` rescales without a jump in virtual time

use core::task::Waker;
use embassy_time_driver::{Driver, TICK_HZ, time_driver_impl};
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant as StdInstant};

/// Q32.32 fixed point one.
const ONE_Q32: u64 = 1u64 << 32;

pub const MIN_SPEED_PERCENT: u32 = 1;
pub const MAX_SPEED_PERCENT: u32 = 10_000;

/// Longest the scheduler sleeps before re-reading the mapping.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(25);

/// Linear mapping `virtual = origin_virtual + (real - origin_real) * scale`.
#[derive(Debug, Clone, Copy)]
struct ClockMapping {
    origin_real: StdInstant,
    origin_virtual_ticks: u64,
    scale_q32: u64,
    speed_percent: u32,
}

impl ClockMapping {
    fn new(origin_real: StdInstant, speed_percent: u32) -> Self {
        let speed_percent = speed_percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT);
        Self {
            origin_real,
            origin_virtual_ticks: 0,
            scale_q32: scale_for(speed_percent),
            speed_percent,
        }
    }

    fn to_virtual(&self, real: StdInstant) -> u64 {
        let real_dt = real.saturating_duration_since(self.origin_real);
        let real_ticks = real_dt.as_nanos() * TICK_HZ as u128 / 1_000_000_000u128;
        let scaled = real_ticks * self.scale_q32 as u128 / ONE_Q32 as u128;
        self.origin_virtual_ticks.saturating_add(scaled.min(u64::MAX as u128) as u64)
    }

    /// Wall-clock instant at which `virtual_ticks` is reached. Targets before
    /// the origin are due at the origin.
    fn to_real(&self, virtual_ticks: u64) -> StdInstant {
        let Some(virt_dt) = virtual_ticks.checked_sub(self.origin_virtual_ticks) else {
            return self.origin_real;
        };
        let real_ticks = virt_dt as u128 * ONE_Q32 as u128 / self.scale_q32 as u128;
        let real_ns = real_ticks * 1_000_000_000u128 / TICK_HZ as u128;
        self.origin_real + Duration::from_nanos(real_ns.min(u64::MAX as u128) as u64)
    }

    /// Same virtual "now" at `real_now`, new rate from there on.
    fn rescaled(&self, real_now: StdInstant, speed_percent: u32) -> Self {
        let speed_percent = speed_percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT);
        Self {
            origin_real: real_now,
            origin_virtual_ticks: self.to_virtual(real_now),
            scale_q32: scale_for(speed_percent),
            speed_percent,
        }
    }
}

fn scale_for(speed_percent: u32) -> u64 {
    (speed_percent as u128 * ONE_Q32 as u128 / 100u128) as u64
}

#[derive(Default)]
struct WakeQueue {
    deadlines: BTreeMap<u64, Vec<Waker>>,
    // Bumped on speed changes so a sleeping scheduler re-evaluates.
    epoch: u64,
}

static CLOCK: OnceLock<Mutex<ClockMapping>> = OnceLock::new();
static QUEUE: OnceLock<Mutex<WakeQueue>> = OnceLock::new();
static QUEUE_CV: OnceLock<Condvar> = OnceLock::new();
static SCHEDULER_STARTED: OnceLock<()> = OnceLock::new();

// A panic while holding one of these locks leaves plain data behind; keep going.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn clock() -> MutexGuard<'static, ClockMapping> {
    lock(CLOCK.get_or_init(|| Mutex::new(ClockMapping::new(StdInstant::now(), 100))))
}

fn queue() -> MutexGuard<'static, WakeQueue> {
    lock(QUEUE.get_or_init(|| Mutex::new(WakeQueue::default())))
}

fn queue_cv() -> &'static Condvar {
    QUEUE_CV.get_or_init(Condvar::new)
}

fn ensure_scheduler_thread() {
    SCHEDULER_STARTED.get_or_init(|| {
        let spawned = std::thread::Builder::new()
            .name("virtual-clock-scheduler".into())
            .spawn(scheduler_thread);
        if let Err(err) = spawned {
            log::error!("failed to start virtual clock scheduler: {}", err);
        }
    });
}

fn scheduler_thread() {
    loop {
        // Snapshot the earliest deadline without touching the clock lock.
        let (next_at, snapshot_epoch) = {
            let mut guard = queue();
            loop {
                if let Some((&next_at, _)) = guard.deadlines.iter().next() {
                    break (next_at, guard.epoch);
                }
                guard = queue_cv().wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        let real_target = clock().to_real(next_at);
        let real_now = StdInstant::now();
        if real_target > real_now {
            let wait = (real_target - real_now).min(MAX_WAIT_SLICE);
            let guard = queue();
            if guard.epoch == snapshot_epoch {
                let _ = queue_cv().wait_timeout(guard, wait);
            }
            continue;
        }

        let virtual_now = clock().to_virtual(StdInstant::now());
        let ready: Vec<Waker> = {
            let mut guard = queue();
            let later = guard.deadlines.split_off(&virtual_now.saturating_add(1));
            let due = std::mem::replace(&mut guard.deadlines, later);
            due.into_values().flatten().collect()
        };
        for waker in ready {
            waker.wake();
        }
    }
}

struct VirtualClockDriver;

impl Driver for VirtualClockDriver {
    fn now(&self) -> u64 {
        clock().to_virtual(StdInstant::now())
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        ensure_scheduler_thread();
        queue().deadlines.entry(at).or_default().push(waker.clone());
        queue_cv().notify_all();
    }
}

time_driver_impl!(static DRIVER: VirtualClockDriver = VirtualClockDriver);

/// Change how fast virtual time runs relative to wall-clock time.
///
/// Clamped to `MIN_SPEED_PERCENT..=MAX_SPEED_PERCENT`. Virtual time stays
/// continuous across the change; pending timers fire at their original
/// virtual deadline under the new rate.
pub fn set_simulation_speed_percent(percent: u32) {
    {
        let mut mapping = clock();
        if mapping.speed_percent == percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT) {
            return;
        }
        *mapping = mapping.rescaled(StdInstant::now(), percent);
        log::debug!("virtual clock speed set to {}%", mapping.speed_percent);
    }
    {
        let mut guard = queue();
        guard.epoch = guard.epoch.wrapping_add(1);
    }
    queue_cv().notify_all();
}

pub fn simulation_speed_percent() -> u32 {
    clock().speed_percent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks(seconds: f64) -> u64 {
        (TICK_HZ as f64 * seconds) as u64
    }

    #[test]
    fn virtual_time_runs_at_configured_speed() {
        let origin = StdInstant::now();
        let mapping = ClockMapping::new(origin, 400);
        let after = mapping.to_virtual(origin + Duration::from_millis(250));
        assert!(after.abs_diff(ticks(1.0)) <= ticks(0.001), "got {after} ticks");
    }

    #[test]
    fn virtual_to_real_scales_inverse_with_speed() {
        let origin = StdInstant::now();
        let mapping = ClockMapping::new(origin, 200);
        let real = mapping.to_real(ticks(0.2));
        let real_dt = real.duration_since(origin).as_secs_f64();
        assert!((real_dt - 0.1).abs() < 0.001, "expected ~0.1s, got {real_dt}s");
    }

    #[test]
    fn rescaling_keeps_virtual_time_continuous() {
        let origin = StdInstant::now();
        let mapping = ClockMapping::new(origin, 100);
        let switch = origin + Duration::from_secs(3);
        let before = mapping.to_virtual(switch);

        let faster = mapping.rescaled(switch, 1000);
        assert_eq!(faster.to_virtual(switch), before);
        let later = faster.to_virtual(switch + Duration::from_secs(1));
        assert!(later.abs_diff(before + ticks(10.0)) <= ticks(0.001));
    }

    #[test]
    fn past_targets_are_due_at_origin() {
        let origin = StdInstant::now();
        let mapping = ClockMapping::new(origin, 100).rescaled(origin + Duration::from_secs(1), 300);
        assert_eq!(mapping.to_real(0), mapping.origin_real);
    }

    #[test]
    fn speed_is_clamped() {
        let origin = StdInstant::now();
        assert_eq!(ClockMapping::new(origin, 0).speed_percent, MIN_SPEED_PERCENT);
        assert_eq!(ClockMapping::new(origin, u32::MAX).speed_percent, MAX_SPEED_PERCENT);
    }
}
