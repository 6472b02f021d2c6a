//! Generation stamps for SystemV segments.
//!
//! A key can be destroyed and recreated between two writes, so readers tag
//! their attachment with the stamp the writer assigned when it allocated
//! the segment. Stamps are wall-clock nanoseconds, bumped when the clock
//! does not move forward so they never repeat within a process.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST: AtomicI64 = AtomicI64::new(0);

/// Return a stamp strictly greater than every stamp returned before.
pub fn next() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default();

    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last.saturating_add(1));
        match LAST.compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}
