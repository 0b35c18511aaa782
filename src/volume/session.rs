// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The volume's own session registry (§3 Session, §4.4 AddSession /
//! RemoveSession / FindSession) — distinct from `CommandHandlerSession`
//! (§4.3), which is the per-worker-thread handle into the command
//! handler's trace and unit-attention FIFO.

use dashmap::DashMap;

/// Immutable after creation; belongs to exactly one volume (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub session_id: u64,
    pub target_name: String,
    pub initiator_name: String,
    pub lun: u32,
}

/// Concurrent session map usable without the volume write lock (§5); the
/// session-id *set* backing `Volume`'s invariants is still mutated only
/// under the volume's write lock by the caller.
#[derive(Default)]
pub struct SessionMap {
    sessions: DashMap<u64, Session>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Session) {
        self.sessions.insert(session.session_id, session);
    }

    pub fn remove(&self, session_id: u64) -> Option<Session> {
        self.sessions.remove(&session_id).map(|(_, v)| v)
    }

    pub fn find(&self, session_id: u64) -> Option<Session> {
        self.sessions.get(&session_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn all(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}
