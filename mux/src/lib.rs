// Copyright 2024 Cobalt Network Foundation
// This file is part of the cobalt library.

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:

// http://www.apache.org/licenses/LICENSE-2.0

// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A minimal stream-session multiplexer.
//!
//! A [`Session`] turns a single ordered byte transport into any number of
//! independent, bidirectional [`Stream`]s. One side of the connection takes
//! the [`SessionSide::Client`] role and opens streams with odd identifiers,
//! the other takes [`SessionSide::Server`] and opens streams with even
//! identifiers, so simultaneous opens can never collide.
//!
//! All reads from the transport are owned by a single demultiplexing task
//! that routes frame payloads to per-stream channels; all writes are funneled
//! through a writer task. Closing the session invalidates every outstanding
//! stream.

#![forbid(unsafe_code)]

mod frame;
mod session;
mod stream;

pub use session::{Session, SessionSide};
pub use stream::Stream;

/// The maximum number of payload bytes carried by a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;
