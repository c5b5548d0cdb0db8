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

//! Bandwidth accounting and rate limiting for gateway connections.
//!
//! Both are injected collaborators: the gateway only attaches new
//! connections to a [`BandwidthMonitor`] and wraps RPC substreams in a
//! [`Limited`] adapter driven by the per-gateway and the process-global
//! [`RateLimit`].

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    task::{ready, Context, Poll},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep, Instant, Sleep},
};

/// Counts the bytes flowing through every connection it is attached to.
#[derive(Default)]
pub struct BandwidthMonitor {
    received: AtomicU64,
    sent: AtomicU64,
}

impl BandwidthMonitor {
    pub fn register_received(&self, size: u64) {
        self.received.fetch_add(size, Relaxed);
    }

    pub fn register_sent(&self, size: u64) {
        self.sent.fetch_add(size, Relaxed);
    }

    /// Returns the total `(received, sent)` byte counts.
    pub fn totals(&self) -> (u64, u64) {
        (self.received.load(Relaxed), self.sent.load(Relaxed))
    }
}

/// A transport adapter feeding byte counts into a [`BandwidthMonitor`].
pub struct Monitored<S> {
    inner: S,
    monitor: Arc<BandwidthMonitor>,
}

impl<S> Monitored<S> {
    pub fn new(inner: S, monitor: Arc<BandwidthMonitor>) -> Self {
        Self { inner, monitor }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Monitored<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        self.monitor.register_received((buf.filled().len() - before) as u64);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Monitored<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let written = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        self.monitor.register_sent(written as u64);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A token-bucket byte budget shared by any number of connections.
pub struct RateLimit {
    /// Sustained bytes per second; 0 means unlimited.
    bytes_per_sec: u64,
    /// The size of the bucket, i.e. the tolerated burst.
    burst: u64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: i64,
    refilled: Instant,
}

impl RateLimit {
    pub fn new(bytes_per_sec: u64, burst: u64) -> Arc<Self> {
        Arc::new(Self {
            bytes_per_sec,
            burst: burst.max(1),
            bucket: Mutex::new(Bucket { tokens: burst.max(1) as i64, refilled: Instant::now() }),
        })
    }

    /// A rate limit that never delays anything.
    pub fn unlimited() -> Arc<Self> {
        Self::new(0, 0)
    }

    /// Consumes `size` tokens and returns how long the caller should pause
    /// to stay within the budget, if it overdrew the bucket.
    fn debit(&self, size: u64) -> Option<Duration> {
        if self.bytes_per_sec == 0 {
            return None;
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let refill = (now - bucket.refilled).as_secs_f64() * self.bytes_per_sec as f64;
        bucket.tokens = (bucket.tokens + refill as i64).min(self.burst as i64);
        bucket.refilled = now;
        bucket.tokens -= size as i64;

        if bucket.tokens >= 0 {
            None
        } else {
            Some(Duration::from_secs_f64(-bucket.tokens as f64 / self.bytes_per_sec as f64))
        }
    }
}

/// The injected bandwidth collaborators: the per-gateway rate limit, the
/// process-global rate limit, and the bandwidth monitor every connection is
/// attached to. Tests swap these for permissive in-memory instances, which
/// is also the default.
#[derive(Clone)]
pub struct Limits {
    /// The per-gateway rate limit, applied to every RPC substream.
    pub gateway: Arc<RateLimit>,
    /// The process-global rate limit, applied after the per-gateway one.
    pub global: Arc<RateLimit>,
    /// The process-wide bandwidth monitor.
    pub monitor: Arc<BandwidthMonitor>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            gateway: RateLimit::unlimited(),
            global: RateLimit::unlimited(),
            monitor: Arc::new(BandwidthMonitor::default()),
        }
    }
}

/// A transport adapter applying one or more [`RateLimit`]s to a stream.
///
/// Accounting is settled after each read or write: an overdrawn budget
/// delays the next operation rather than splitting the current one.
pub struct Limited<S> {
    inner: S,
    limits: Vec<Arc<RateLimit>>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<S> Limited<S> {
    pub fn new(inner: S, limits: Vec<Arc<RateLimit>>) -> Self {
        Self { inner, limits, delay: None }
    }

    fn poll_delay(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(delay) = self.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.delay = None;
        }
        Poll::Ready(())
    }

    fn settle(&mut self, size: u64) {
        if let Some(pause) = self.limits.iter().filter_map(|limit| limit.debit(size)).max() {
            self.delay = Some(Box::pin(sleep(pause)));
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Limited<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_delay(cx));
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let size = (buf.filled().len() - before) as u64;
        self.settle(size);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Limited<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        ready!(self.poll_delay(cx));
        let written = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        self.settle(written as u64);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn unlimited_never_delays() {
        let limit = RateLimit::unlimited();
        assert!(limit.debit(u64::MAX / 2).is_none());
        assert!(limit.debit(u64::MAX / 2).is_none());
    }

    #[test]
    fn burst_then_delay() {
        let limit = RateLimit::new(1000, 500);
        // Within the burst.
        assert!(limit.debit(400).is_none());
        // Overdraws the bucket; roughly 900 tokens short at 1000 B/s.
        let pause = limit.debit(1000).expect("should overdraw");
        assert!(pause >= Duration::from_millis(500) && pause <= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn monitored_counts_both_directions() {
        let monitor = Arc::new(BandwidthMonitor::default());
        let (a, mut b) = tokio::io::duplex(1024);
        let mut a = Monitored::new(a, monitor.clone());

        a.write_all(b"0123456789").await.unwrap();
        let mut buf = [0u8; 10];
        b.read_exact(&mut buf).await.unwrap();
        b.write_all(b"abc").await.unwrap();
        a.read_exact(&mut buf[..3]).await.unwrap();

        let (received, sent) = monitor.totals();
        assert_eq!(received, 3);
        assert_eq!(sent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn limited_paces_writes() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut a = Limited::new(a, vec![RateLimit::new(1024, 1024)]);

        tokio::spawn(async move {
            let mut sink = vec![0u8; 8 * 1024];
            while b.read(&mut sink).await.map(|n| n > 0).unwrap_or(false) {}
        });

        let started = tokio::time::Instant::now();
        // 4 KiB over a 1 KiB/s budget with a 1 KiB burst: about 3 seconds.
        for _ in 0..4 {
            a.write_all(&[0u8; 1024]).await.unwrap();
        }
        a.flush().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
