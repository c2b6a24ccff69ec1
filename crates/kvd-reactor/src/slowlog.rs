//! Slow command log.
//!
//! Remembers the most recent commands whose measured execution time crossed
//! a configured threshold. Entries sit in a bounded list, newest at the
//! head; the oldest fall off the tail. The log never aliases live command
//! state: argument vectors are copied (and truncated) at insertion time.
//!
//! The GET/LEN/RESET/HELP surface is spoken by the command dispatcher; this
//! module only provides the storage operations behind it.

use crate::clock;
use crate::list::{Direction, List};
use tracing::debug;

/// Hard cap on argv entries retained per record. The last retained slot of
/// an over-long vector holds a synthetic count of what was dropped.
pub const MAX_ARGC: usize = 32;

/// Hard cap on bytes retained per argument string.
pub const MAX_STRING: usize = 128;

/// Help text served for the `SLOWLOG HELP` subcommand.
pub const HELP: &[&str] = &[
    "GET [count] -- Return top entries from the slowlog (default: 10).",
    "    Entries are made of: id, timestamp, time in microseconds,",
    "    arguments array, client IP and port, client name.",
    "LEN -- Return the length of the slowlog.",
    "RESET -- Reset the slowlog.",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowLogEntry {
    /// Monotonically increasing, never reused while the log lives.
    pub id: u64,
    /// Unix time the entry was recorded.
    pub wall_time: i64,
    pub duration_us: i64,
    pub argv: Vec<String>,
    pub peer_addr: String,
    pub client_name: String,
}

pub struct SlowLog {
    entries: List<SlowLogEntry>,
    next_id: u64,
    threshold_us: i64,
    max_len: usize,
}

impl SlowLog {
    /// `threshold_us < 0` disables recording entirely.
    pub fn new(threshold_us: i64, max_len: usize) -> Self {
        Self { entries: List::new(), next_id: 0, threshold_us, max_len }
    }

    pub fn threshold_us(&self) -> i64 {
        self.threshold_us
    }

    pub fn set_threshold_us(&mut self, threshold_us: i64) {
        self.threshold_us = threshold_us;
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
        self.trim();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record one completed command if it crossed the threshold.
    pub fn push_if_needed(
        &mut self,
        peer_addr: &str,
        client_name: &str,
        argv: &[String],
        duration_us: i64,
    ) {
        if self.threshold_us < 0 {
            return;
        }
        if duration_us < self.threshold_us {
            return;
        }
        let entry = self.make_entry(peer_addr, client_name, argv, duration_us);
        debug!(id = entry.id, duration_us, peer = peer_addr, "slow command recorded");
        self.entries.push_front(entry);
        self.trim();
    }

    fn make_entry(
        &mut self,
        peer_addr: &str,
        client_name: &str,
        argv: &[String],
        duration_us: i64,
    ) -> SlowLogEntry {
        let retained = argv.len().min(MAX_ARGC);
        let mut stored = Vec::with_capacity(retained);
        for (j, arg) in argv.iter().take(retained).enumerate() {
            if retained != argv.len() && j == retained - 1 {
                // Past the cap the last slot counts leftovers instead of
                // holding a truncated argument.
                stored.push(format!("... ({} more arguments)", argv.len() - retained + 1));
            } else if arg.len() > MAX_STRING {
                let cut = (0..=MAX_STRING)
                    .rev()
                    .find(|&i| arg.is_char_boundary(i))
                    .unwrap_or(0);
                let mut s = arg[..cut].to_string();
                s.push_str(&format!("... ({} more bytes)", arg.len() - MAX_STRING));
                stored.push(s);
            } else {
                stored.push(arg.clone());
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        SlowLogEntry {
            id,
            wall_time: clock::unix_seconds(),
            duration_us,
            argv: stored,
            peer_addr: peer_addr.to_string(),
            client_name: client_name.to_string(),
        }
    }

    fn trim(&mut self) {
        while self.entries.len() > self.max_len {
            if let Some(tail) = self.entries.back() {
                self.entries.remove(tail);
            } else {
                break;
            }
        }
    }

    /// Up to `count` entries, newest first.
    pub fn entries(&self, count: usize) -> Vec<&SlowLogEntry> {
        let mut out = Vec::new();
        let mut cur = self.entries.cursor(Direction::HeadToTail);
        while out.len() < count {
            match cur.next(&self.entries) {
                Some(node) => {
                    if let Some(entry) = self.entries.get(node) {
                        out.push(entry);
                    }
                }
                None => break,
            }
        }
        out
    }

    /// Drop every entry.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
