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

use std::io;

use parking_lot::Mutex;

use crate::nodes::Node;

/// The persistence hooks delegated to the node-discovery subsystem.
///
/// The gateway calls these at the commit points that must survive a restart;
/// the payload format is the implementor's business. Failures after a manual
/// disconnect are reported to the caller, since the user asked for a durable
/// change; everywhere else they are logged and swallowed.
pub trait Store: Send + Sync + 'static {
    /// Persists both the node set and the blocklist.
    fn save_sync(&self, nodes: &[Node], blocklist: &[String]) -> io::Result<()>;

    /// Persists the node set only.
    fn save_sync_nodes(&self, nodes: &[Node]) -> io::Result<()>;
}

/// An in-memory [`Store`], used in tests and by nodes that opt out of
/// persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    nodes: Vec<Node>,
    blocklist: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last persisted node set.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.lock().nodes.clone()
    }

    /// Returns the last persisted blocklist.
    pub fn blocklist(&self) -> Vec<String> {
        self.inner.lock().blocklist.clone()
    }
}

impl Store for MemoryStore {
    fn save_sync(&self, nodes: &[Node], blocklist: &[String]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.nodes = nodes.to_vec();
        inner.blocklist = blocklist.to_vec();
        Ok(())
    }

    fn save_sync_nodes(&self, nodes: &[Node]) -> io::Result<()> {
        self.inner.lock().nodes = nodes.to_vec();
        Ok(())
    }
}
