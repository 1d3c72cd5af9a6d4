//! Invalidation generations
//!
//! Readers that fill the cache after a store round trip take a
//! `Generation` before the I/O and write back with
//! `CacheCoordinator::set_if_current`. The log remembers what each recent
//! invalidation matched, so a fill is dropped only when an invalidation
//! since its generation covers the key.

use regex::Regex;
use std::collections::VecDeque;

/// Point in the coordinator's invalidation history
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
enum Recorded {
    Everything,
    Matching(Regex),
}

impl Recorded {
    fn covers(&self, key: &str) -> bool {
        match self {
            Self::Everything => true,
            Self::Matching(matcher) => matcher.is_match(key),
        }
    }
}

/// Bounded history of invalidations, newest last
#[derive(Debug)]
pub(crate) struct InvalidationLog {
    current: u64,
    entries: VecDeque<(u64, Recorded)>,
    capacity: usize,
}

impl InvalidationLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            current: 0,
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn current(&self) -> Generation {
        Generation(self.current)
    }

    pub(crate) fn record(&mut self, matcher: Regex) {
        self.push(Recorded::Matching(matcher));
    }

    pub(crate) fn record_all(&mut self) {
        self.push(Recorded::Everything);
    }

    /// Whether anything recorded after `since` may have removed `key`
    ///
    /// History older than the log's capacity is unknown and counts as covered.
    pub(crate) fn invalidated_since(&self, since: Generation, key: &str) -> bool {
        if since.0 >= self.current {
            return false;
        }

        let oldest_kept = self.entries.front().map(|(generation, _)| *generation).unwrap_or(self.current + 1);
        if since.0 + 1 < oldest_kept {
            return true;
        }

        self.entries
            .iter()
            .filter(|(generation, _)| *generation > since.0)
            .any(|(_, recorded)| recorded.covers(key))
    }

    fn push(&mut self, recorded: Recorded) {
        self.current += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((self.current, recorded));
    }
}
