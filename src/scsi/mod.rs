// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pure SCSI opcode decoding and reply encoding (§4.2). No I/O.

pub mod capacity;
pub mod command;
pub mod constants;
pub mod inquiry;
pub mod mode_sense;
pub mod sense;

pub use command::Command;
pub use command::DecodeError;
pub use sense::Sense;
