//! Throughput meters: a monotonic count plus 1/5/15-minute moving rates.
//!
//! Rates are exponentially-weighted moving averages ticked in 5-second
//! quanta.  Ticks are applied lazily on `mark`/`snapshot` rather than by a
//! timer task, so an idle meter costs nothing; the count itself is a
//! lock-free atomic so the hot producer/consumer paths never contend on
//! the rate state beyond a short critical section.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

const TICK_SECONDS: u64 = 5;

/// A monotonic counter with rolling rates, shared via `Arc`.
#[derive(Debug)]
pub struct Meter {
    count: AtomicU64,
    started: Instant,
    rates: Mutex<Rates>,
}

/// Point-in-time view of a meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSnapshot {
    pub count: u64,
    pub mean_rate: f64,
    pub one_minute_rate: f64,
    pub five_minute_rate: f64,
    pub fifteen_minute_rate: f64,
}

#[derive(Debug)]
struct Rates {
    last_tick: Instant,
    uncounted: u64,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl Default for Meter {
    fn default() -> Self {
        let now = Instant::now();
        Meter {
            count: AtomicU64::new(0),
            started: now,
            rates: Mutex::new(Rates {
                last_tick: now,
                uncounted: 0,
                m1: Ewma::new(1.0),
                m5: Ewma::new(5.0),
                m15: Ewma::new(15.0),
            }),
        }
    }
}

impl Meter {
    pub fn new() -> Self {
        Meter::default()
    }

    /// Record `n` events.
    pub fn mark(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
        let mut rates = self.rates.lock().expect("meter lock poisoned");
        rates.advance(Instant::now());
        rates.uncounted += n;
    }

    /// Total events since creation.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let count = self.count();
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut rates = self.rates.lock().expect("meter lock poisoned");
        rates.advance(Instant::now());
        MeterSnapshot {
            count,
            mean_rate: if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            },
            one_minute_rate: rates.m1.rate,
            five_minute_rate: rates.m5.rate,
            fifteen_minute_rate: rates.m15.rate,
        }
    }
}

impl Rates {
    /// Apply every 5-second tick that has elapsed since the last one: the
    /// first tick consumes the uncounted marks, the rest decay toward zero.
    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        let ticks = elapsed.as_secs() / TICK_SECONDS;
        if ticks == 0 {
            return;
        }
        let uncounted = std::mem::take(&mut self.uncounted);
        self.m1.tick(uncounted, ticks);
        self.m5.tick(uncounted, ticks);
        self.m15.tick(uncounted, ticks);
        self.last_tick += std::time::Duration::from_secs(ticks * TICK_SECONDS);
    }
}

#[derive(Debug)]
struct Ewma {
    alpha: f64,
    rate: f64,
    initialized: bool,
}

impl Ewma {
    fn new(minutes: f64) -> Self {
        Ewma {
            alpha: 1.0 - (-(TICK_SECONDS as f64) / 60.0 / minutes).exp(),
            rate: 0.0,
            initialized: false,
        }
    }

    fn tick(&mut self, uncounted: u64, ticks: u64) {
        let instant_rate = uncounted as f64 / TICK_SECONDS as f64;
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
        // Remaining ticks saw no marks; decay.
        if ticks > 1 {
            self.rate *= (1.0 - self.alpha).powi((ticks - 1) as i32);
        }
    }
}
