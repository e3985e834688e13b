// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Diagnostics channel
//!
//! A best-effort sink for single-character trace marks, failure report
//! lines and structured allocator events. Sends never block: a full or
//! disconnected channel only bumps the dropped counter. Observability is
//! the only thing lost when the sink is absent.

use crate::alloc::AllocEvent;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use rtvm_common::TraceMark;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// One record written to the diagnostics channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagRecord {
    /// Single-character lock or allocator trace
    Mark(TraceMark),
    /// Human-readable report line
    Report(String),
    /// Structured allocator event
    Alloc(AllocEvent),
}

/// Cloneable, non-blocking diagnostics sink
#[derive(Clone, Default)]
pub struct Diagnostics {
    tx: Option<Sender<DiagRecord>>,
    marks: bool,
    dropped: Arc<AtomicU64>,
}

impl Diagnostics {
    /// Sink that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Bounded channel sink and its receiving end
    ///
    /// With `marks` off only reports and allocator events are sent.
    pub fn channel(capacity: usize, marks: bool) -> (Self, DiagReceiver) {
        let (tx, rx) = channel::bounded(capacity.max(1));
        let sink = Self {
            tx: Some(tx),
            marks,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, DiagReceiver { rx })
    }

    /// Same sink with trace marks switched on or off
    pub fn with_marks(mut self, marks: bool) -> Self {
        self.marks = marks;
        self
    }

    /// Whether records go anywhere
    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Records lost to a full or closed channel
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Emit a trace mark
    #[inline]
    pub fn mark(&self, mark: TraceMark) {
        trace!(mark = %mark.as_char(), "diag");
        if self.marks {
            self.send(DiagRecord::Mark(mark));
        }
    }

    /// Emit a report line
    pub fn report(&self, line: impl Into<String>) {
        self.send(DiagRecord::Report(line.into()));
    }

    /// Emit an allocator event
    pub fn alloc_event(&self, event: AllocEvent) {
        self.send(DiagRecord::Alloc(event));
    }

    fn send(&self, record: DiagRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("enabled", &self.is_enabled())
            .field("marks", &self.marks)
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Receiving end of a diagnostics channel
pub struct DiagReceiver {
    rx: Receiver<DiagRecord>,
}

impl DiagReceiver {
    /// Take every pending record
    pub fn drain(&self) -> Vec<DiagRecord> {
        self.rx.try_iter().collect()
    }

    /// Pending trace marks as a string, e.g. `"lu"`; other records are discarded
    pub fn marks(&self) -> String {
        self.drain()
            .into_iter()
            .filter_map(|record| match record {
                DiagRecord::Mark(mark) => Some(mark.as_char()),
                _ => None,
            })
            .collect()
    }

    /// Pending allocator events; other records are discarded
    pub fn alloc_events(&self) -> Vec<AllocEvent> {
        self.drain()
            .into_iter()
            .filter_map(|record| match record {
                DiagRecord::Alloc(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Underlying channel, for blocking consumers
    pub fn receiver(&self) -> &Receiver<DiagRecord> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_in_order() {
        let (diag, rx) = Diagnostics::channel(16, true);
        diag.mark(TraceMark::Lock);
        diag.mark(TraceMark::Unlock);
        diag.report("hello");
        assert_eq!(rx.marks(), "lu");
    }

    #[test]
    fn test_marks_disabled_keeps_reports() {
        let (diag, rx) = Diagnostics::channel(16, false);
        diag.mark(TraceMark::Lock);
        diag.report("heap exhausted");
        assert_eq!(rx.drain(), vec![DiagRecord::Report("heap exhausted".into())]);
    }

    #[test]
    fn test_with_marks_toggles() {
        let (diag, rx) = Diagnostics::channel(16, false);
        let diag = diag.with_marks(true);
        diag.mark(TraceMark::Deadlock);
        assert_eq!(rx.marks(), "D");
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (diag, rx) = Diagnostics::channel(2, true);
        for _ in 0..5 {
            diag.mark(TraceMark::Lock);
        }
        assert_eq!(diag.dropped(), 3);
        assert_eq!(rx.drain().len(), 2);
    }

    #[test]
    fn test_disconnected_and_disabled_sinks() {
        let (diag, rx) = Diagnostics::channel(2, true);
        drop(rx);
        diag.report("nobody listens");
        assert_eq!(diag.dropped(), 1);

        let off = Diagnostics::disabled();
        off.mark(TraceMark::Lock);
        off.report("ignored");
        assert!(!off.is_enabled());
        assert_eq!(off.dropped(), 0);
    }
}
