//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use json_observe::{observer, ChangeKind, ChangeRecord, EngineConfig, ManualClock, Observer, Registry};
use serde_json::Value as Json;

/// Routes `tracing` output through the test harness. Safe to call from every
/// test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Observer that stores every flush it receives.
#[derive(Clone, Default)]
pub struct Collector {
    flushes: Rc<RefCell<Vec<Vec<ChangeRecord>>>>,
}

impl Collector {
    pub fn observer(&self) -> Observer {
        let flushes = Rc::clone(&self.flushes);
        observer(move |changes| flushes.borrow_mut().push(changes.to_vec()))
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.borrow().len()
    }

    /// Number of records in each flush, in delivery order.
    pub fn flush_sizes(&self) -> Vec<usize> {
        self.flushes.borrow().iter().map(Vec::len).collect()
    }

    pub fn records(&self) -> Vec<ChangeRecord> {
        self.flushes.borrow().iter().flatten().cloned().collect()
    }

    /// `(kind, dotted path)` of every record, in delivery order.
    pub fn paths(&self) -> Vec<(ChangeKind, String)> {
        self.records()
            .into_iter()
            .map(|r| (r.kind, r.dotted_path))
            .collect()
    }

    pub fn summaries(&self) -> Vec<Json> {
        self.records().iter().map(ChangeRecord::summary).collect()
    }

    pub fn clear(&self) {
        self.flushes.borrow_mut().clear();
    }
}

/// Registry on a manual clock with the given grace window and batch delay.
pub fn manual_registry(grace_window_ms: u64, batch_delay_ms: u64) -> (Registry, ManualClock) {
    init_tracing();
    let clock = ManualClock::new();
    let config = EngineConfig {
        grace_window_ms,
        batch_delay_ms,
        ..EngineConfig::default()
    };
    (Registry::with_clock(config, clock.clone()), clock)
}

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}
