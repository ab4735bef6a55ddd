//! Node id minting.
//!
//! Ids are `"{replica}_{counter}"` where the counter is derived from the wall
//! clock in milliseconds. If the clock has not advanced past the last issued
//! value (two edits in the same millisecond, or the clock jumped backwards),
//! the last value is incremented instead, so ids from one replica are
//! strictly increasing.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::node::NodeId;

type Clock = Box<dyn FnMut() -> i64 + Send>;

/// Mints monotonically increasing [`NodeId`]s for one replica.
pub struct IdGenerator {
    replica_id: String,
    last: i64,
    clock: Clock,
}

impl IdGenerator {
    /// Generator driven by the system wall clock.
    pub fn new(replica_id: impl Into<String>) -> Self {
        Self::with_clock(replica_id, wall_clock_millis)
    }

    /// Generator driven by a custom clock (tests, simulations).
    ///
    /// A clock that always returns `0` yields `replica_1`, `replica_2`, …
    pub fn with_clock(
        replica_id: impl Into<String>,
        clock: impl FnMut() -> i64 + Send + 'static,
    ) -> Self {
        Self {
            replica_id: replica_id.into(),
            last: 0,
            clock: Box::new(clock),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Last counter handed out (0 before the first id).
    pub fn last_counter(&self) -> i64 {
        self.last
    }

    /// Mint the next id.
    pub fn next_id(&mut self) -> NodeId {
        let now = (self.clock)();
        self.next_id_at(now)
    }

    /// Mint the next id as if the clock read `now`.
    pub fn next_id_at(&mut self, now: i64) -> NodeId {
        let counter = if now <= self.last {
            self.last + 1
        } else {
            now
        };
        self.last = counter;
        NodeId::from_parts(&self.replica_id, counter)
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("replica_id", &self.replica_id)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

fn wall_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
