// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-volume bounded error-report ring (§3, §9 REDESIGN FLAG: rate-limited
//! persistence instead of persisting every report).

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::persistence::InfoStore;
use crate::scsi::constants::DEFAULT_ERROR_REPORT_RING_SIZE;

const PERSIST_MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorReport {
    pub opcode: u8,
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub message: String,
}

fn info_store_key(volume_id: u32) -> String {
    format!("volume.{}.ch.error", volume_id)
}

/// Bounded ring of the most recent error reports for one volume, persisted
/// to an `InfoStore` at most once per second (§9: avoids a write-amplifying
/// fsync per SCSI error under sustained failure).
pub struct ErrorReportLog {
    volume_id: u32,
    ring: Mutex<VecDeque<ErrorReport>>,
    last_persisted: Mutex<Option<Instant>>,
}

impl ErrorReportLog {
    pub fn new(volume_id: u32) -> Self {
        ErrorReportLog {
            volume_id,
            ring: Mutex::new(VecDeque::with_capacity(DEFAULT_ERROR_REPORT_RING_SIZE)),
            last_persisted: Mutex::new(None),
        }
    }

    pub fn load(volume_id: u32, store: &dyn InfoStore) -> Result<Self, crate::persistence::IndexError> {
        let log = Self::new(volume_id);
        if let Some(bytes) = store.get(&info_store_key(volume_id))? {
            let reports: Vec<ErrorReport> = serde_json::from_slice(&bytes)?;
            *log.ring.lock() = reports.into();
        }
        Ok(log)
    }

    /// Appends a report, evicting the oldest on overflow, then persists if
    /// at least one second has elapsed since the last persist (§3).
    pub fn record(&self, report: ErrorReport, store: &dyn InfoStore, now: Instant) {
        {
            let mut ring = self.ring.lock();
            if ring.len() == DEFAULT_ERROR_REPORT_RING_SIZE {
                ring.pop_front();
            }
            ring.push_back(report);
        }
        self.maybe_persist(store, now);
    }

    fn maybe_persist(&self, store: &dyn InfoStore, now: Instant) {
        let mut last = self.last_persisted.lock();
        let due = match *last {
            Some(t) => now.duration_since(t) >= PERSIST_MIN_INTERVAL,
            None => true,
        };
        if !due {
            return;
        }
        let snapshot: Vec<ErrorReport> = self.ring.lock().iter().cloned().collect();
        if let Ok(bytes) = serde_json::to_vec(&snapshot) {
            if store.put(&info_store_key(self.volume_id), bytes).is_ok() {
                *last = Some(now);
            }
        }
    }

    /// Forces a persist regardless of the rate limit; used on clean
    /// shutdown so the last burst of reports is not lost.
    pub fn flush(&self, store: &dyn InfoStore) {
        let snapshot: Vec<ErrorReport> = self.ring.lock().iter().cloned().collect();
        if let Ok(bytes) = serde_json::to_vec(&snapshot) {
            let _ = store.put(&info_store_key(self.volume_id), bytes);
        }
    }

    pub fn snapshot(&self) -> Vec<ErrorReport> {
        self.ring.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryInfoStore;

    fn sample(n: u8) -> ErrorReport {
        ErrorReport {
            opcode: n,
            sense_key: 0x03,
            asc: 0x11,
            ascq: 0x00,
            message: format!("read error {}", n),
        }
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let store = InMemoryInfoStore::new();
        let log = ErrorReportLog::new(1);
        let t0 = Instant::now();
        for i in 0..(DEFAULT_ERROR_REPORT_RING_SIZE + 10) {
            log.record(sample(i as u8), &store, t0);
        }
        assert_eq!(log.snapshot().len(), DEFAULT_ERROR_REPORT_RING_SIZE);
        assert_eq!(log.snapshot().front().unwrap().opcode, 10);
    }

    #[test]
    fn persistence_is_rate_limited() {
        let store = InMemoryInfoStore::new();
        let log = ErrorReportLog::new(7);
        let t0 = Instant::now();
        log.record(sample(1), &store, t0);
        let first = store.get("volume.7.ch.error").unwrap();
        assert!(first.is_some());

        // A second record within the same instant must not trigger another
        // persist, but the in-memory ring still grows.
        log.record(sample(2), &store, t0);
        let still_first: Vec<ErrorReport> =
            serde_json::from_slice(&store.get("volume.7.ch.error").unwrap().unwrap()).unwrap();
        assert_eq!(still_first.len(), 1);
        assert_eq!(log.snapshot().len(), 2);

        // After the rate-limit window elapses, the next record persists the
        // full accumulated snapshot.
        log.record(sample(3), &store, t0 + Duration::from_secs(2));
        let after: Vec<ErrorReport> =
            serde_json::from_slice(&store.get("volume.7.ch.error").unwrap().unwrap()).unwrap();
        assert_eq!(after.len(), 3);
    }

    #[test]
    fn load_restores_ring_from_store() {
        let store = InMemoryInfoStore::new();
        let log = ErrorReportLog::new(3);
        log.record(sample(1), &store, Instant::now());
        log.flush(&store);

        let restored = ErrorReportLog::load(3, &store).unwrap();
        assert_eq!(restored.snapshot().len(), 1);
    }
}
