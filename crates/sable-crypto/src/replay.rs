//! Request salt replay defense.
//!
//! A connection's request salt must never be accepted twice within the
//! replay window. The pool records each salt's insertion time, so a
//! salt is inadmissible for exactly the window and admissible again the
//! moment it ages out. Expired entries are swept lazily on access,
//! bounding memory by the handshake rate rather than by connection
//! lifetime.
//!
//! # Thread Safety
//!
//! Internally synchronized; [`SaltPool::check_and_insert`] is a
//! linearizable test-and-set.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Timed set of request salts.
#[derive(Debug)]
pub struct SaltPool {
    window: Duration,
    inner: Mutex<Salts>,
}

#[derive(Debug)]
struct Salts {
    seen: HashMap<Vec<u8>, Instant>,
    last_sweep: Instant,
}

impl SaltPool {
    /// Create a pool whose entries persist for `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(Salts {
                seen: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Returns true iff `salt` has not been seen within the window, and
    /// records it atomically.
    pub fn check_and_insert(&self, salt: &[u8]) -> bool {
        let mut inner = self.inner.lock().expect("salt pool poisoned");
        let now = Instant::now();

        if now.duration_since(inner.last_sweep) >= self.window {
            let window = self.window;
            inner
                .seen
                .retain(|_, inserted| now.duration_since(*inserted) < window);
            inner.last_sweep = now;
        }

        match inner.seen.get_mut(salt) {
            Some(inserted) if now.duration_since(*inserted) < self.window => false,
            Some(inserted) => {
                // Aged out but not yet swept; admit and restart its clock.
                *inserted = now;
                true
            }
            None => {
                inner.seen.insert(salt.to_vec(), now);
                true
            }
        }
    }
}
