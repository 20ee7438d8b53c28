//! Bounded busy-polling.
//!
//! The transport only exposes completion *counts*, so waiting for the peer
//! means spinning on a counter. [`SpinWait`] bounds such a spin with a
//! deadline; [`wait_completed`] applies it to an accelerator counter.

use std::hint;
use std::time::Duration;

use quanta::Instant;
use thiserror::Error;

use crate::accel::{Accelerator, Oper};

/// Completion wait error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// The counter did not reach the target before the deadline.
    #[error("timed out after {waited:?} waiting for {target} {oper} completions (observed {observed})")]
    TimedOut {
        oper: Oper,
        target: u32,
        observed: u32,
        waited: Duration,
    },

    /// The counter went past the target, so more operations completed than
    /// this round accounts for.
    #[error("expected {target} {oper} completions but observed {observed}")]
    Overshoot {
        oper: Oper,
        target: u32,
        observed: u32,
    },
}

/// Statistics of a finished wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waited {
    /// Number of times the condition was evaluated.
    pub polls: u64,
    pub elapsed: Duration,
}

/// A spin loop with an optional deadline.
///
/// `None` as timeout spins forever.
#[derive(Debug)]
pub struct SpinWait {
    start: Instant,
    timeout: Option<Duration>,
    polls: u64,
    #[cfg(feature = "warned_spin")]
    warned: bool,
}

impl SpinWait {
    /// Elapsed time after which a warning is logged when `warned_spin` is on.
    #[cfg(feature = "warned_spin")]
    pub const WARN_AFTER: Duration = Duration::from_secs(1);

    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            timeout,
            polls: 0,
            #[cfg(feature = "warned_spin")]
            warned: false,
        }
    }

    /// Time since the wait started.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Statistics so far.
    #[inline]
    pub fn waited(&self) -> Waited {
        Waited {
            polls: self.polls,
            elapsed: self.elapsed(),
        }
    }

    /// Record one unsuccessful poll and decide whether to keep spinning.
    ///
    /// Returns the elapsed time once the deadline has passed.
    pub fn tick(&mut self) -> Result<(), Duration> {
        self.polls += 1;
        let elapsed = self.elapsed();

        #[cfg(feature = "warned_spin")]
        if !self.warned && elapsed >= Self::WARN_AFTER {
            log::warn!("scatterbench: still spinning after {:?}", elapsed);
            self.warned = true;
        }

        match self.timeout {
            Some(timeout) if elapsed >= timeout => Err(elapsed),
            _ => {
                hint::spin_loop();
                Ok(())
            }
        }
    }

    /// Spin until `f` yields a value or the deadline passes.
    pub fn until<T>(&mut self, mut f: impl FnMut() -> Option<T>) -> Result<T, Duration> {
        loop {
            if let Some(v) = f() {
                self.polls += 1;
                return Ok(v);
            }
            self.tick()?;
        }
    }
}

/// Spin until `accel` reports exactly `target` completions of `oper`.
///
/// This is the only point where the server waits for its peer's data to land,
/// so it must not return before the count is reached; it returns an error
/// instead of hanging forever if `timeout` is given.
pub fn wait_completed<A: Accelerator + ?Sized>(
    accel: &A,
    oper: Oper,
    target: u32,
    timeout: Option<Duration>,
) -> Result<Waited, PollError> {
    let mut spin = SpinWait::new(timeout);
    let mut observed = 0;
    let reached = spin.until(|| {
        observed = accel.check_completed(oper);
        (observed >= target).then_some(observed)
    });

    match reached {
        Ok(n) if n == target => Ok(spin.waited()),
        Ok(n) => Err(PollError::Overshoot {
            oper,
            target,
            observed: n,
        }),
        Err(waited) => Err(PollError::TimedOut {
            oper,
            target,
            observed,
            waited,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::mock::MockAccel;

    #[test]
    fn test_reaches_target() {
        let accel = MockAccel::new();
        accel.set_peer_writes(5);
        let waited =
            wait_completed(&accel, Oper::LocalWrite, 5, Some(Duration::from_secs(5))).unwrap();
        assert!(waited.polls >= 5);
        assert_eq!(accel.check_completed(Oper::LocalWrite), 5);
    }

    #[test]
    fn test_times_out() {
        let accel = MockAccel::new();
        accel.set_peer_writes(2);
        let err = wait_completed(&accel, Oper::LocalWrite, 3, Some(Duration::from_millis(20)))
            .unwrap_err();
        match err {
            PollError::TimedOut {
                oper,
                target,
                observed,
                waited,
            } => {
                assert_eq!(oper, Oper::LocalWrite);
                assert_eq!(target, 3);
                assert_eq!(observed, 2);
                assert!(waited >= Duration::from_millis(20));
            }
            e => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_overshoot() {
        let accel = MockAccel::new();
        accel.set_peer_writes(4);
        accel.deliver_all();
        let err = wait_completed(&accel, Oper::LocalWrite, 3, None).unwrap_err();
        assert_eq!(
            err,
            PollError::Overshoot {
                oper: Oper::LocalWrite,
                target: 3,
                observed: 4
            }
        );
    }

    #[test]
    fn test_spin_until() {
        let mut spin = SpinWait::new(Some(Duration::from_secs(1)));
        let mut n = 0;
        let v = spin
            .until(|| {
                n += 1;
                (n == 10).then_some(n)
            })
            .unwrap();
        assert_eq!(v, 10);
        assert_eq!(spin.waited().polls, 10);
    }
}
