// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The volume lifecycle state machine (§4.4).

/// `state` ∈ {CREATED, STARTED, RUNNING, STOPPED, FAILED} (§3); `maintenance`
/// is tracked separately as it is orthogonal to this machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VolumeState {
    Created,
    Started,
    Running,
    Stopped,
    Failed,
}

impl VolumeState {
    /// Whether `to` is reachable from `self` in one admin-driven transition
    /// (§4.4). `Failed` is reachable from any state (worker error) and is
    /// terminal except for `Close`, which this machine does not model as a
    /// state (the owning `Volume` is torn down instead).
    pub fn can_transition_to(self, to: VolumeState) -> bool {
        use VolumeState::*;
        match (self, to) {
            (Created, Started) => true,
            (Started, Running) => true,
            (Running, Stopped) => true,
            (Stopped, Running) => true,
            (_, Failed) => self != Failed,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_to_started_to_running() {
        assert!(VolumeState::Created.can_transition_to(VolumeState::Started));
        assert!(VolumeState::Started.can_transition_to(VolumeState::Running));
    }

    #[test]
    fn stopped_can_cycle_back_to_running() {
        assert!(VolumeState::Stopped.can_transition_to(VolumeState::Running));
    }

    #[test]
    fn any_state_can_fail_except_failed() {
        assert!(VolumeState::Running.can_transition_to(VolumeState::Failed));
        assert!(!VolumeState::Failed.can_transition_to(VolumeState::Failed));
    }

    #[test]
    fn created_cannot_skip_to_running() {
        assert!(!VolumeState::Created.can_transition_to(VolumeState::Running));
    }
}
