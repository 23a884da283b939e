/* Tuned sleeps between DDC operations.
 *
 * The DDC spec mandates minimum quiet intervals between bus transactions;
 * monitors that are rushed answer with garbage or the Null Message.  The
 * effective duration is base * global multiplier * per-display dynamic
 * adjustment.  Sleeps use the monotonic clock and are not cancellation
 * points; cancellation is checked between retries. */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::status::{DdcError, ErrorInfo};

/* Why we are sleeping, with the DDC-mandated base duration. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepEvent {
    PostOpen,
    PostWrite,
    WriteToRead,
    PostRead,
    DdcNull,
    PostSaveSettings,
}

impl SleepEvent {
    pub fn base_millis(self) -> u64 {
        match self {
            SleepEvent::PostOpen => 50,
            SleepEvent::PostWrite => 40,
            SleepEvent::WriteToRead => 40,
            SleepEvent::PostRead => 10,
            SleepEvent::DdcNull => 100,
            SleepEvent::PostSaveSettings => 200,
        }
    }
}

pub const SLEEP_MULTIPLIER_MIN: f64 = 0.1;
pub const SLEEP_MULTIPLIER_MAX: f64 = 10.0;

static SLEEP_MULTIPLIER_BITS: AtomicU64 = AtomicU64::new(0x3ff0_0000_0000_0000); /* 1.0 */
static DYNAMIC_SLEEP_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn set_sleep_multiplier(multiplier: f64) -> Result<(), ErrorInfo> {
    if !multiplier.is_finite()
        || !(SLEEP_MULTIPLIER_MIN..=SLEEP_MULTIPLIER_MAX).contains(&multiplier)
    {
        return Err(ErrorInfo::from_ddc(
            DdcError::Arg,
            "set_sleep_multiplier",
            format!("multiplier {multiplier} outside {SLEEP_MULTIPLIER_MIN}..={SLEEP_MULTIPLIER_MAX}"),
        ));
    }
    SLEEP_MULTIPLIER_BITS.store(multiplier.to_bits(), Ordering::Relaxed);
    Ok(())
}

pub fn sleep_multiplier() -> f64 {
    f64::from_bits(SLEEP_MULTIPLIER_BITS.load(Ordering::Relaxed))
}

pub fn set_dynamic_sleep_enabled(enabled: bool) {
    DYNAMIC_SLEEP_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn dynamic_sleep_enabled() -> bool {
    DYNAMIC_SLEEP_ENABLED.load(Ordering::Relaxed)
}

/* ---------------------------------------------------------------------- */
/* Per-display dynamic adjustment                                         */
/* ---------------------------------------------------------------------- */

const ADJUSTMENT_FLOOR: f64 = 0.5;
const ADJUSTMENT_CEILING: f64 = 2.0;
const SUCCESS_DECREMENT: f64 = 0.05;
const FAILURE_INCREMENT: f64 = 0.1;
const NULL_BOOST_OPS: u8 = 3;

/* Tracks recent DDC outcomes on one display and adjusts its sleeps.
 * Owned by the display handle; only the thread holding the handle
 * updates it. */
#[derive(Debug, Clone)]
pub struct DynamicSleep {
    enabled: bool,
    adjustment: f64,
    null_boost_ops: u8,
}

impl DynamicSleep {
    pub fn new() -> Self {
        DynamicSleep {
            enabled: dynamic_sleep_enabled(),
            adjustment: 1.0,
            null_boost_ops: 0,
        }
    }

    /* The initial-checks probe turns this off to avoid oscillation while
     * it deliberately provokes failures. */
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn adjustment(&self) -> f64 {
        self.adjustment
    }

    pub fn note_success(&mut self) {
        if self.enabled {
            self.adjustment = (self.adjustment - SUCCESS_DECREMENT).max(ADJUSTMENT_FLOOR);
        }
    }

    pub fn note_retry_failure(&mut self) {
        if self.enabled {
            self.adjustment = (self.adjustment + FAILURE_INCREMENT).min(ADJUSTMENT_CEILING);
        }
    }

    /* A Null Message doubles the adjustment for the next three operations. */
    pub fn note_null_response(&mut self) {
        if self.enabled {
            self.null_boost_ops = NULL_BOOST_OPS;
        }
    }

    /* Factor for the next operation; consumes one boosted slot. */
    pub fn next_factor(&mut self) -> f64 {
        if !self.enabled {
            return 1.0;
        }
        if self.null_boost_ops > 0 {
            self.null_boost_ops -= 1;
            self.adjustment * 2.0
        } else {
            self.adjustment
        }
    }
}

impl Default for DynamicSleep {
    fn default() -> Self {
        Self::new()
    }
}

/* ---------------------------------------------------------------------- */
/* Sleep execution and statistics                                         */
/* ---------------------------------------------------------------------- */

static SLEEP_COUNT: AtomicU64 = AtomicU64::new(0);
static SLEEP_NANOS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Default)]
pub struct SleepStatsSnapshot {
    pub count: u64,
    pub total_nanos: u64,
}

pub fn sleep_stats() -> SleepStatsSnapshot {
    SleepStatsSnapshot {
        count: SLEEP_COUNT.load(Ordering::Relaxed),
        total_nanos: SLEEP_NANOS.load(Ordering::Relaxed),
    }
}

pub(crate) fn reset_sleep_stats() {
    SLEEP_COUNT.store(0, Ordering::Relaxed);
    SLEEP_NANOS.store(0, Ordering::Relaxed);
}

fn effective_millis(event: SleepEvent, dynamic_factor: f64) -> f64 {
    event.base_millis() as f64 * sleep_multiplier() * dynamic_factor
}

/* Suspend the calling thread for the tuned duration of `event`. */
pub(crate) fn tuned_sleep(event: SleepEvent, dynamic: Option<&mut DynamicSleep>) {
    let factor = dynamic.map_or(1.0, |d| d.next_factor());
    let millis = effective_millis(event, factor);
    debug!("tuned sleep {event:?}: {millis:.1} ms");
    let start = Instant::now();
    std::thread::sleep(Duration::from_micros((millis * 1000.0) as u64));
    SLEEP_COUNT.fetch_add(1, Ordering::Relaxed);
    SLEEP_NANOS.fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_range_enforced() {
        assert!(set_sleep_multiplier(0.05).is_err());
        assert!(set_sleep_multiplier(11.0).is_err());
        assert!(set_sleep_multiplier(f64::NAN).is_err());
        /* 0.1 is what the protocol tests run under, so a concurrent
         * writer stores the same value and the read-back stays stable. */
        set_sleep_multiplier(0.1).unwrap();
        assert_eq!(sleep_multiplier(), 0.1);
    }

    #[test]
    fn base_durations_match_the_ddc_intervals() {
        assert_eq!(SleepEvent::PostOpen.base_millis(), 50);
        assert_eq!(SleepEvent::PostWrite.base_millis(), 40);
        assert_eq!(SleepEvent::WriteToRead.base_millis(), 40);
        assert_eq!(SleepEvent::PostRead.base_millis(), 10);
        assert_eq!(SleepEvent::DdcNull.base_millis(), 100);
        assert_eq!(SleepEvent::PostSaveSettings.base_millis(), 200);
    }

    #[test]
    fn adjustment_stays_clamped() {
        let mut d = DynamicSleep::new();
        d.set_enabled(true);
        for _ in 0..100 {
            d.note_success();
        }
        assert_eq!(d.adjustment(), 0.5);
        for _ in 0..100 {
            d.note_retry_failure();
        }
        assert_eq!(d.adjustment(), 2.0);
    }

    #[test]
    fn null_boost_lasts_three_operations() {
        let mut d = DynamicSleep::new();
        d.set_enabled(true);
        let base = d.adjustment();
        d.note_null_response();
        assert_eq!(d.next_factor(), base * 2.0);
        assert_eq!(d.next_factor(), base * 2.0);
        assert_eq!(d.next_factor(), base * 2.0);
        assert_eq!(d.next_factor(), base);
    }

    #[test]
    fn disabled_controller_is_inert() {
        let mut d = DynamicSleep::new();
        d.set_enabled(false);
        d.note_retry_failure();
        d.note_null_response();
        assert_eq!(d.adjustment(), 1.0);
        assert_eq!(d.next_factor(), 1.0);
    }

    #[test]
    fn mixed_outcomes_remain_in_bounds() {
        let mut d = DynamicSleep::new();
        d.set_enabled(true);
        for i in 0..1000 {
            match i % 3 {
                0 => d.note_success(),
                1 => d.note_retry_failure(),
                _ => d.note_null_response(),
            }
            let adj = d.adjustment();
            assert!((0.5..=2.0).contains(&adj), "adjustment {adj} escaped bounds");
        }
    }
}
