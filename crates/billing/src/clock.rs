//! Injectable clock.
//!
//! The orchestrator captures `now` exactly once per request and reuses it
//! for every subsequent step, so previews and commits can never drift.

use time::OffsetDateTime;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[cfg(any(test, feature = "test-store"))]
pub mod test {
    use std::sync::Mutex;

    use super::*;

    /// Clock pinned to a fixed instant, settable from tests
    pub struct FixedClock {
        now: Mutex<OffsetDateTime>,
    }

    impl FixedClock {
        pub fn at(now: OffsetDateTime) -> Self {
            Self {
                now: Mutex::new(now),
            }
        }

        pub fn set(&self, now: OffsetDateTime) {
            #[allow(clippy::unwrap_used)]
            let mut guard = self.now.lock().unwrap();
            *guard = now;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> OffsetDateTime {
            #[allow(clippy::unwrap_used)]
            let guard = self.now.lock().unwrap();
            *guard
        }
    }
}
