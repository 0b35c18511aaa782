// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small set of process-wide collaborators shared by every other crate in
//! the workspace: logging setup and the `error!`/`warn!`/`info!`/`debug!`
//! macro re-exports, a cooperative-cancellation `Event`, and `WorkerThread`,
//! the one-thread-per-worker pattern the volume subsystem and the
//! background lifecycle workers are all built from.

mod event;
pub mod syslog;
mod worker_thread;

pub use event::Event;
pub use log::*;
pub use worker_thread::WorkerThread;
