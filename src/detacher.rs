// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Background block-index cleanup for detached volumes (§4.6): one worker
//! thread per volume currently detaching, paced by whether the system is
//! idle or busy.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use base::error;
use base::info;
use base::Event;
use base::WorkerThread;
use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::dedup_engine::DedupSystem;
use crate::persistence::IndexError;
use crate::persistence::PersistentIndex;
use crate::scsi::constants::DETACHER_BUSY_BATCH_SIZE;
use crate::scsi::constants::DETACHER_BUSY_SLEEP_MS;
use crate::scsi::constants::DETACHER_IDLE_BATCH_SIZE;
use crate::scsi::constants::DETACHER_IDLE_SLEEP_MS;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DetacherState {
    Created,
    Started,
    Running,
    Stopped,
}

/// `{volume_id, former_device_name, former_logical_size, start_block_id,
/// end_block_id, current_block_id?}` (§3): the persisted cursor into one
/// volume's block interval, plus enough of the volume's former identity
/// to report on while it is still reclaiming.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetachingData {
    pub volume_id: u32,
    pub former_device_name: String,
    pub former_logical_size: u64,
    pub start_block_id: u64,
    pub end_block_id: u64,
    pub current_block_id: Option<u64>,
}

/// Something the detacher asks at batch boundaries to pick a pacing
/// profile; the real implementation is outside core scope (§1), this is
/// the interface the worker loop is written against.
pub trait IdleDetector: Send + Sync {
    fn is_idle(&self) -> bool;
}

pub struct AlwaysIdle;
impl IdleDetector for AlwaysIdle {
    fn is_idle(&self) -> bool {
        true
    }
}

struct Pacing {
    batch_size: u64,
    sleep: Duration,
}

fn pacing(idle: bool) -> Pacing {
    if idle {
        Pacing {
            batch_size: DETACHER_IDLE_BATCH_SIZE,
            sleep: Duration::from_millis(DETACHER_IDLE_SLEEP_MS),
        }
    } else {
        Pacing {
            batch_size: DETACHER_BUSY_BATCH_SIZE,
            sleep: Duration::from_millis(DETACHER_BUSY_SLEEP_MS),
        }
    }
}

/// Owns the persistent `volume_id -> DetachingData` index and the
/// `volume_id -> worker` map (§4.6).
pub struct VolumeDetacher {
    state: Mutex<DetacherState>,
    index: Arc<dyn PersistentIndex<u32, DetachingData>>,
    dedup_system: Arc<dyn DedupSystem>,
    idle_detector: Arc<dyn IdleDetector>,
    workers: Mutex<std::collections::HashMap<u32, WorkerThread<()>>>,
}

impl VolumeDetacher {
    pub fn new(
        index: Arc<dyn PersistentIndex<u32, DetachingData>>,
        dedup_system: Arc<dyn DedupSystem>,
        idle_detector: Arc<dyn IdleDetector>,
    ) -> Arc<VolumeDetacher> {
        Arc::new(VolumeDetacher {
            state: Mutex::new(DetacherState::Created),
            index,
            dedup_system,
            idle_detector,
            workers: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn state(&self) -> DetacherState {
        *self.state.lock()
    }

    pub fn start(&self) -> Result<(), IndexError> {
        self.index.start()?;
        *self.state.lock() = DetacherState::Started;
        Ok(())
    }

    /// Starts one worker per entry already present in the index, then
    /// flips to RUNNING.
    pub fn run(self: &Arc<Self>) -> Result<(), IndexError> {
        *self.state.lock() = DetacherState::Running;
        for (volume_id, _) in self.index.iter_all()? {
            self.spawn_worker(volume_id);
        }
        Ok(())
    }

    pub fn stop(&self) {
        *self.state.lock() = DetacherState::Stopped;
        let workers: Vec<_> = self.workers.lock().drain().collect();
        for (_, worker) in workers {
            worker.stop();
        }
    }

    /// §4.6 `DetachVolume(volume)`: flushes the chunk store, inserts a
    /// fresh `DetachingData` with put-if-absent semantics (duplicate is an
    /// error), and starts the worker immediately if already RUNNING.
    pub fn detach_volume(
        self: &Arc<Self>,
        volume_id: u32,
        former_device_name: String,
        former_logical_size: u64,
        block_interval: (u64, u64),
    ) -> Result<(), IndexError> {
        self.dedup_system
            .flush_chunk_store()
            .map_err(|e| IndexError::Backend(e.to_string()))?;
        let data = DetachingData {
            volume_id,
            former_device_name,
            former_logical_size,
            start_block_id: block_interval.0,
            end_block_id: block_interval.1,
            current_block_id: None,
        };
        self.index.put_if_absent(volume_id, &data)?;
        if self.state() == DetacherState::Running {
            self.spawn_worker(volume_id);
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, volume_id: u32) {
        let detacher = self.clone();
        let name = format!("dedupv1-detach{}", volume_id);
        let worker = WorkerThread::start(name, move |kill_evt| {
            detacher.worker_loop(volume_id, kill_evt);
        });
        self.workers.lock().insert(volume_id, worker);
    }

    fn worker_loop(&self, volume_id: u32, kill_evt: Event) {
        loop {
            if self.state() != DetacherState::Running {
                break;
            }
            let data = match self.index.lookup(&volume_id) {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) => {
                    error!("detacher: failed to load volume {}: {}", volume_id, e);
                    break;
                }
            };
            let mut cursor = data.current_block_id.unwrap_or(data.start_block_id);
            if cursor >= data.end_block_id {
                let _ = self.index.delete(&volume_id);
                info!("volume {} fully detached", volume_id);
                break;
            }

            let pacing = pacing(self.idle_detector.is_idle());
            let batch_end = (cursor + pacing.batch_size).min(data.end_block_id);
            let mut failed = false;
            while cursor < batch_end {
                if self.dedup_system.delete_block_info(volume_id, cursor).is_err() {
                    failed = true;
                    break;
                }
                cursor += 1;
            }

            let mut updated = data;
            updated.current_block_id = Some(cursor);
            if self.index.put(volume_id, &updated).is_err() {
                error!("detacher: failed to persist cursor for volume {}", volume_id);
                break;
            }
            if failed {
                error!("detacher: block delete failed for volume {} at block {}", volume_id, cursor);
                break;
            }
            if cursor >= updated.end_block_id {
                let _ = self.index.delete(&volume_id);
                info!("volume {} fully detached", volume_id);
                break;
            }
            if kill_evt.wait_timeout(pacing.sleep) {
                break;
            }
        }
    }

    pub fn is_detaching(&self, volume_id: u32) -> bool {
        matches!(self.index.lookup(&volume_id), Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup_engine::EngineError;
    use crate::persistence::InMemoryIndex;
    use std::sync::atomic::AtomicU64;

    struct CountingDedupSystem {
        deletes: AtomicU64,
        fail_at: Option<u64>,
    }

    impl DedupSystem for CountingDedupSystem {
        fn register_volume(
            &self,
            _volume_id: u32,
            _dedup_volume: Arc<dyn crate::dedup_engine::DedupVolume>,
        ) -> Result<(), EngineError> {
            Ok(())
        }
        fn unregister_volume(&self, _volume_id: u32) -> Result<(), EngineError> {
            Ok(())
        }
        fn flush_chunk_store(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn delete_block_info(&self, _volume_id: u32, block_id: u64) -> Result<(), EngineError> {
            if self.fail_at == Some(block_id) {
                return Err(EngineError::Rejected("forced failure".to_string()));
            }
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn system(fail_at: Option<u64>) -> Arc<CountingDedupSystem> {
        Arc::new(CountingDedupSystem {
            deletes: AtomicU64::new(0),
            fail_at,
        })
    }

    #[test]
    fn detach_then_fully_detach_removes_index_entry() {
        let index: Arc<InMemoryIndex<u32, DetachingData>> = Arc::new(InMemoryIndex::new());
        let detacher = VolumeDetacher::new(index.clone(), system(None), Arc::new(AlwaysIdle));
        detacher.start().unwrap();
        detacher.run().unwrap();
        detacher.detach_volume(1, "dedupv1-1".to_string(), 5120, (0, 10)).unwrap();

        for _ in 0..50 {
            if index.lookup(&1).unwrap().is_none() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(index.lookup(&1).unwrap().is_none());
        assert!(!detacher.is_detaching(1));
        detacher.stop();
    }

    #[test]
    fn duplicate_detach_is_rejected() {
        let index: Arc<InMemoryIndex<u32, DetachingData>> = Arc::new(InMemoryIndex::new());
        let detacher = VolumeDetacher::new(index, system(None), Arc::new(AlwaysIdle));
        detacher.start().unwrap();
        detacher.detach_volume(1, "dedupv1-1".to_string(), 512_000_000, (0, 1_000_000)).unwrap();
        let err = detacher.detach_volume(1, "dedupv1-1".to_string(), 512_000_000, (0, 1_000_000)).unwrap_err();
        assert!(matches!(err, IndexError::AlreadyPresent));
        detacher.stop();
    }

    #[test]
    fn worker_stops_on_delete_failure_without_removing_entry() {
        let index: Arc<InMemoryIndex<u32, DetachingData>> = Arc::new(InMemoryIndex::new());
        let detacher = VolumeDetacher::new(index.clone(), system(Some(3)), Arc::new(AlwaysIdle));
        detacher.start().unwrap();
        detacher.run().unwrap();
        detacher.detach_volume(2, "dedupv1-2".to_string(), 5120, (0, 10)).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        let data = index.lookup(&2).unwrap().expect("entry still present after failure");
        assert!(data.current_block_id.is_some());
        detacher.stop();
    }
}
