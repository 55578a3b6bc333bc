//! Always-on named counters.
//!
//! The IC subsystem logs how often it attempts, commits, aborts and
//! invalidates rewrites. Counters are cheap (one relaxed atomic add) so
//! they stay enabled in release builds; tests use them to assert
//! fast-path-vs-slow-path behavior without instrumenting the code under
//! test.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lazy_static::lazy_static;

lazy_static! {
    static ref COUNTERS: Mutex<BTreeMap<&'static str, &'static AtomicU64>> =
        Mutex::new(BTreeMap::new());
}

/// A named monotonic counter. Create them as `static`s at use sites:
///
/// ```ignore
/// static IC_REWRITES: StatCounter = StatCounter::new("ic_rewrites");
/// IC_REWRITES.log();
/// ```
pub struct StatCounter {
    name: &'static str,
    value: AtomicU64,
    registered: std::sync::Once,
}

impl StatCounter {
    pub const fn new(name: &'static str) -> StatCounter {
        StatCounter {
            name,
            value: AtomicU64::new(0),
            registered: std::sync::Once::new(),
        }
    }

    pub fn log(&'static self) {
        self.log_n(1);
    }

    pub fn log_n(&'static self, n: u64) {
        self.registered.call_once(|| {
            COUNTERS.lock().unwrap().insert(self.name, &self.value);
        });
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&'static self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Current value of a counter by name (0 if it never fired).
pub fn counter(name: &str) -> u64 {
    COUNTERS
        .lock()
        .unwrap()
        .get(name)
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

/// Snapshot of every counter that has fired at least once.
pub fn snapshot() -> BTreeMap<&'static str, u64> {
    COUNTERS
        .lock()
        .unwrap()
        .iter()
        .map(|(&k, v)| (k, v.load(Ordering::Relaxed)))
        .collect()
}

/// Render the snapshot, one `name: value` per line (debugging aid).
pub fn dump() -> String {
    let mut out = String::new();
    for (name, value) in snapshot() {
        out.push_str(&format!("{}: {}\n", name, value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        static TEST_COUNTER: StatCounter = StatCounter::new("stats_test_counter");
        let before = TEST_COUNTER.get();
        TEST_COUNTER.log();
        TEST_COUNTER.log_n(2);
        assert_eq!(TEST_COUNTER.get(), before + 3);
        assert_eq!(counter("stats_test_counter"), before + 3);
    }
}
