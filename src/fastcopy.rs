// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Background fast-copy engine (§4.7): one worker thread draining a queue
//! of target-volume ids, stepping 64 MiB at a time with durable progress
//! so a crash resumes from the last persisted offset.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use base::error;
use base::info;
use base::Event;
use base::WorkerThread;
use serde::Deserialize;
use serde::Serialize;
use sync::Condvar;
use sync::Mutex;

use crate::dedup_engine::DedupVolume;
use crate::dedup_engine::ErrorContext;
use crate::persistence::IndexError;
use crate::persistence::InfoStore;
use crate::scsi::constants::FAST_COPY_STEP_BYTES;

pub const FAST_COPY_INFO_STORE_KEY: &str = "volume-fastcopy";

/// One fast-copy job (§4.7): `src -> tgt`, `[src_start, src_start+size)`
/// copied to `[tgt_start, tgt_start+size)`, `current_offset` the durable
/// cursor within `[0, size)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobData {
    pub source_id: u32,
    pub target_id: u32,
    pub src_start: u64,
    pub tgt_start: u64,
    pub size: u64,
    pub current_offset: u64,
    pub job_failed: bool,
}

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    jobs: Vec<JobData>,
}

/// The subset of `VolumeInfo` the fast-copy engine needs: resolving a
/// volume id to its dedup-engine handle without taking the volume's own
/// reader/writer lock for longer than the lookup itself (§4.7: "taking
/// and releasing each volume's lock in turn").
pub trait VolumeLookup: Send + Sync {
    fn dedup_volume(&self, volume_id: u32) -> Option<Arc<dyn DedupVolume>>;
}

struct FastCopyState {
    jobs: HashMap<u32, JobData>,
    queue: VecDeque<u32>,
    queued: HashSet<u32>,
    sources: HashMap<u32, HashSet<u32>>,
}

impl FastCopyState {
    fn new() -> Self {
        FastCopyState {
            jobs: HashMap::new(),
            queue: VecDeque::new(),
            queued: HashSet::new(),
            sources: HashMap::new(),
        }
    }

    fn enqueue(&mut self, target_id: u32) {
        if self.queued.insert(target_id) {
            self.queue.push_back(target_id);
        }
    }
}

/// `FastCopyEngine`: single background thread, a `target_id -> JobData`
/// map, a `src -> targets` multimap, and a persisted `{jobs}` snapshot
/// under `volume-fastcopy` (§4.7).
pub struct FastCopyEngine {
    state: Mutex<FastCopyState>,
    change: Condvar,
    info_store: Arc<dyn InfoStore>,
    volumes: Arc<dyn VolumeLookup>,
    worker: Mutex<Option<WorkerThread<()>>>,
}

impl FastCopyEngine {
    pub fn new(info_store: Arc<dyn InfoStore>, volumes: Arc<dyn VolumeLookup>) -> Arc<FastCopyEngine> {
        Arc::new(FastCopyEngine {
            state: Mutex::new(FastCopyState::new()),
            change: Condvar::new(),
            info_store,
            volumes,
            worker: Mutex::new(None),
        })
    }

    /// Restores the persisted snapshot and enqueues every recorded job.
    pub fn start(&self) -> Result<(), IndexError> {
        let snapshot: Snapshot = match self.info_store.get(FAST_COPY_INFO_STORE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Snapshot::default(),
        };
        let mut state = self.state.lock();
        for job in snapshot.jobs {
            state.sources.entry(job.source_id).or_default().insert(job.target_id);
            state.enqueue(job.target_id);
            state.jobs.insert(job.target_id, job);
        }
        Ok(())
    }

    pub fn run(self: &Arc<Self>) {
        let engine = self.clone();
        let worker = WorkerThread::start("dedupv1-fastcopy", move |kill_evt| {
            engine.worker_loop(kill_evt);
        });
        *self.worker.lock() = Some(worker);
    }

    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
    }

    /// `StartNewFastCopyJob`: inserts the job, persists, enqueues, and
    /// wakes the worker. Rejects a target that already has a job (§4.7:
    /// "at most one job per target").
    pub fn start_new_job(&self, job: JobData) -> Result<(), IndexError> {
        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.target_id) {
            return Err(IndexError::AlreadyPresent);
        }
        state.sources.entry(job.source_id).or_default().insert(job.target_id);
        state.enqueue(job.target_id);
        state.jobs.insert(job.target_id, job);
        self.persist_locked(&state)?;
        drop(state);
        self.change.notify_all();
        Ok(())
    }

    pub fn is_fast_copy_source(&self, volume_id: u32) -> bool {
        self.state.lock().sources.get(&volume_id).is_some_and(|t| !t.is_empty())
    }

    pub fn is_fast_copy_target(&self, volume_id: u32) -> bool {
        self.state.lock().jobs.contains_key(&volume_id)
    }

    fn persist_locked(&self, state: &FastCopyState) -> Result<(), IndexError> {
        let snapshot = Snapshot {
            jobs: state.jobs.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        self.info_store.put(FAST_COPY_INFO_STORE_KEY, bytes)
    }

    fn worker_loop(&self, kill_evt: Event) {
        loop {
            let target_id = {
                let mut state = self.state.lock();
                loop {
                    if kill_evt.is_signaled() {
                        return;
                    }
                    if let Some(id) = state.queue.pop_front() {
                        state.queued.remove(&id);
                        break id;
                    }
                    self.change.wait_timeout(&mut state, std::time::Duration::from_millis(500));
                }
            };
            self.run_step(target_id);
            if kill_evt.is_signaled() {
                return;
            }
        }
    }

    fn run_step(&self, target_id: u32) {
        let job = match self.state.lock().jobs.get(&target_id).cloned() {
            Some(job) => job,
            None => return,
        };
        if job.job_failed {
            self.finish_job(target_id);
            return;
        }

        let source = self.volumes.dedup_volume(job.source_id);
        let target = self.volumes.dedup_volume(job.target_id);
        let (source, target) = match (source, target) {
            (Some(s), Some(t)) => (s, t),
            _ => {
                error!("fast-copy: volume missing for job {}->{}", job.source_id, job.target_id);
                self.mark_failed_and_persist(target_id);
                return;
            }
        };

        let step = FAST_COPY_STEP_BYTES.min(job.size - job.current_offset);
        let mut ctx = ErrorContext::new();
        let result = source.fast_copy_to(
            target.as_ref(),
            job.src_start + job.current_offset,
            job.tgt_start + job.current_offset,
            step,
            &mut ctx,
        );

        let mut state = self.state.lock();
        let Some(stored) = state.jobs.get_mut(&target_id) else {
            return;
        };
        match result {
            Ok(()) => {
                stored.current_offset += step;
                let done = stored.current_offset >= stored.size;
                let stored_clone = stored.clone();
                let _ = self.persist_locked(&state);
                if done {
                    state.jobs.remove(&target_id);
                    if let Some(targets) = state.sources.get_mut(&stored_clone.source_id) {
                        targets.remove(&target_id);
                    }
                    let _ = self.persist_locked(&state);
                    info!("fast-copy {} -> {} completed", stored_clone.source_id, target_id);
                } else {
                    state.enqueue(target_id);
                }
            }
            Err(e) => {
                error!("fast-copy step failed for job -> {}: {}", target_id, e);
                stored.job_failed = true;
                let _ = self.persist_locked(&state);
                drop(state);
                self.finish_job(target_id);
            }
        }
    }

    fn mark_failed_and_persist(&self, target_id: u32) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&target_id) {
            job.job_failed = true;
        }
        let _ = self.persist_locked(&state);
        drop(state);
        self.finish_job(target_id);
    }

    fn finish_job(&self, target_id: u32) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.remove(&target_id) {
            if let Some(targets) = state.sources.get_mut(&job.source_id) {
                targets.remove(&target_id);
            }
        }
        let _ = self.persist_locked(&state);
    }
}
