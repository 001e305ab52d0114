//! GC Logging and Tracing
//!
//! Structured records of collector activity, kept in a bounded ring and
//! mirrored to the `log` facade:
//! - INFO: cycle start/end
//! - DEBUG: phase transitions
//! - TRACE: per-page operations
//!
//! The ring is what `latest_gc_info` style introspection reads; the log
//! facade is for operators.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Why a collection started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GcTrigger {
    /// Allocator could not produce a free page.
    Newobj,
    /// Malloc accounting tripped its limit.
    Malloc,
    /// Explicit request from the host.
    Method,
    /// Collection forced while preparing the heap.
    Force,
}

/// Structured GC events.
#[derive(Debug, Clone, Serialize)]
pub enum GcEvent {
    /// A cycle began.
    CycleStart {
        count: u64,
        full: bool,
        trigger: GcTrigger,
        immediate_sweep: bool,
    },

    /// Marking finished.
    MarkEnd {
        count: u64,
        marked_slots: usize,
        old_objects: usize,
    },

    /// Sweeping finished.
    SweepEnd {
        count: u64,
        freed: u64,
        empty_pages: usize,
    },

    /// Compaction finished.
    CompactEnd {
        count: u64,
        moved_objects: usize,
        moved_up: usize,
        moved_down: usize,
    },

    /// A cycle completed.
    CycleEnd { count: u64, duration: Duration },
}

/// Bounded ring of recent GC events.
pub struct GcEventLog {
    ring: VecDeque<GcEvent>,
    limit: usize,
}

impl GcEventLog {
    pub fn new(limit: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Record an event and mirror it to the log facade.
    pub fn record(&mut self, event: GcEvent) {
        match &event {
            GcEvent::CycleStart {
                count,
                full,
                trigger,
                ..
            } => {
                log::info!(
                    "gc start #{} ({}) trigger={:?}",
                    count,
                    if *full { "major" } else { "minor" },
                    trigger
                );
            }
            GcEvent::MarkEnd {
                count, marked_slots, ..
            } => log::debug!("gc mark end #{} marked={}", count, marked_slots),
            GcEvent::SweepEnd { count, freed, .. } => {
                log::debug!("gc sweep end #{} freed={}", count, freed)
            }
            GcEvent::CompactEnd {
                count,
                moved_objects,
                ..
            } => log::debug!("gc compact end #{} moved={}", count, moved_objects),
            GcEvent::CycleEnd { count, duration } => {
                log::info!("gc end #{} in {:?}", count, duration)
            }
        }

        if self.ring.len() == self.limit {
            self.ring.pop_front();
        }
        self.ring.push_back(event);
    }

    /// Most recent event, if any.
    pub fn latest(&self) -> Option<&GcEvent> {
        self.ring.back()
    }

    /// All retained events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &GcEvent> {
        self.ring.iter()
    }

    /// Serialize the retained events for host introspection.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.ring.iter().collect::<Vec<_>>()).unwrap_or_default()
    }
}

impl Default for GcEventLog {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_bounded() {
        let mut log = GcEventLog::new(2);
        for i in 0..5 {
            log.record(GcEvent::CycleEnd {
                count: i,
                duration: Duration::from_millis(1),
            });
        }
        assert_eq!(log.events().count(), 2);
        match log.latest() {
            Some(GcEvent::CycleEnd { count, .. }) => assert_eq!(*count, 4),
            other => panic!("unexpected {:?}", other.is_some()),
        }
    }

    #[test]
    fn test_json_snapshot() {
        let mut log = GcEventLog::default();
        log.record(GcEvent::CycleStart {
            count: 1,
            full: true,
            trigger: GcTrigger::Method,
            immediate_sweep: false,
        });
        let json = log.to_json();
        assert!(json.contains("CycleStart"));
    }
}
