// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin re-exports over `parking_lot`, kept as their own crate so every other
//! crate in the workspace depends on locks the same way and can be
//! repointed at a different implementation in one place.
//!
//! `parking_lot`'s `Mutex`/`RwLock` do not poison on panic, which matches
//! how the volume subsystem wants locks to behave: a panicking worker
//! thread should not wedge every other session on the same volume.

pub use parking_lot::Condvar;
pub use parking_lot::Mutex;
pub use parking_lot::MutexGuard;
pub use parking_lot::RwLock;
pub use parking_lot::RwLockReadGuard;
pub use parking_lot::RwLockWriteGuard;
pub use parking_lot::WaitTimeoutResult;
