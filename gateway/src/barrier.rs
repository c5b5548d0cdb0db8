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

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
    Arc,
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// The process-wide shutdown barrier.
///
/// Every spawned task that outlives its caller registers itself and holds the
/// returned [`BarrierGuard`] for its lifetime. Registration fails once
/// [`ShutdownBarrier::stop`] has been called, guaranteeing that no new work
/// is admitted after shutdown begins; `stop` itself blocks until every
/// outstanding guard has been dropped.
#[derive(Clone, Default)]
pub(crate) struct ShutdownBarrier {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: AtomicBool,
    active: AtomicUsize,
    token: CancellationToken,
    all_done: Notify,
}

impl ShutdownBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit of work; fails with [`Error::Stopped`] once shutdown
    /// has begun.
    pub fn register(&self) -> Result<BarrierGuard> {
        if self.inner.stopped.load(SeqCst) {
            return Err(Error::Stopped);
        }
        self.inner.active.fetch_add(1, SeqCst);

        // Re-check: stop() may have read the counter before the increment.
        if self.inner.stopped.load(SeqCst) {
            drop(BarrierGuard { inner: self.inner.clone() });
            return Err(Error::Stopped);
        }

        Ok(BarrierGuard { inner: self.inner.clone() })
    }

    /// Returns the token that is cancelled when shutdown begins. Tasks await
    /// it at every suspension point.
    pub fn stop_signal(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Begins shutdown and waits until every registered task has finished.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, SeqCst);
        self.inner.token.cancel();

        loop {
            let all_done = self.inner.all_done.notified();
            if self.inner.active.load(SeqCst) == 0 {
                return;
            }
            all_done.await;
        }
    }
}

/// Marks one registered unit of work as done on drop.
pub(crate) struct BarrierGuard {
    inner: Arc<Inner>,
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, SeqCst) == 1 {
            self.inner.all_done.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[tokio::test]
    async fn registration_fails_after_stop() {
        let barrier = ShutdownBarrier::new();
        assert!(barrier.register().is_ok());

        barrier.stop().await;
        assert!(matches!(barrier.register(), Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn stop_waits_for_guards() {
        let barrier = ShutdownBarrier::new();
        let guard = barrier.register().unwrap();
        let stop_signal = barrier.stop_signal();

        let task = tokio::spawn(async move {
            stop_signal.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        let started = std::time::Instant::now();
        barrier.stop().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        task.await.unwrap();
    }
}
