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

use std::{
    collections::HashMap,
    io,
    ops::Not,
    sync::{
        atomic::{AtomicU32, Ordering::Relaxed},
        Arc,
    },
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    io::{split, AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::*;

use crate::{
    frame::{Frame, FrameCodec, FrameKind},
    stream::Stream,
};

/// The depth of the per-stream inbound payload queues.
const STREAM_QUEUE_DEPTH: usize = 256;

/// The depth of the queue of streams opened by the remote side and not yet
/// accepted.
const ACCEPT_QUEUE_DEPTH: usize = 64;

/// The depth of the queue of frames awaiting submission to the transport.
const OUTBOUND_QUEUE_DEPTH: usize = 512;

/// Indicates which role the session plays on its underlying connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionSide {
    /// The side that initiated the connection; opens odd stream IDs.
    Client,
    /// The side that accepted the connection; opens even stream IDs.
    Server,
}

impl Not for SessionSide {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// A multiplexer over a single ordered byte transport.
///
/// Streams opened locally via [`Session::open`] and remotely via
/// [`Session::accept`] are fully independent of each other; only the bytes
/// within one stream are ordered. Both operations are safe to call
/// concurrently. [`Session::close`] tears down the transport and invalidates
/// every outstanding stream.
pub struct Session {
    side: SessionSide,
    /// Frames produced by local streams, drained by the writer task.
    outbound: mpsc::Sender<Frame>,
    /// Inbound payload routes, keyed by stream ID; shared with the demuxer.
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>>,
    /// Streams opened by the remote side, queued by the demuxer.
    accept_queue: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    /// The next stream ID to hand out locally.
    next_stream_id: AtomicU32,
    /// Cancelled when the session shuts down, for any reason.
    shutdown: CancellationToken,
}

impl Session {
    /// Creates the initiator-side session over the given transport.
    pub fn client<T>(transport: T, remote_version: &str) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, SessionSide::Client, remote_version)
    }

    /// Creates the responder-side session over the given transport.
    pub fn server<T>(transport: T, remote_version: &str) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, SessionSide::Server, remote_version)
    }

    // The remote version selects the multiplexer; every version to date
    // speaks the one frame format below, so it only gets logged.
    fn new<T>(transport: T, side: SessionSide, remote_version: &str) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        trace!("starting a {side:?} session (remote v{remote_version})");

        let (reader, writer) = split(transport);
        let framed_read = FramedRead::new(reader, FrameCodec::default());
        let framed_write = FramedWrite::new(writer, FrameCodec::default());

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>> = Default::default();
        let shutdown = CancellationToken::new();

        tokio::spawn(write_loop(framed_write, outbound_rx, shutdown.clone()));
        tokio::spawn(demux_loop(
            framed_read,
            streams.clone(),
            accept_tx,
            outbound.clone(),
            side,
            shutdown.clone(),
        ));

        Self {
            side,
            outbound,
            streams,
            accept_queue: tokio::sync::Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(match side {
                SessionSide::Client => 1,
                SessionSide::Server => 2,
            }),
            shutdown,
        }
    }

    /// Returns the session's side of the connection.
    pub fn side(&self) -> SessionSide {
        self.side
    }

    /// Opens a new outgoing stream.
    pub async fn open(&self) -> io::Result<Stream> {
        if self.is_closed() {
            return Err(closed_err());
        }

        let stream_id = self.next_stream_id.fetch_add(2, Relaxed);
        let (payload_tx, payload_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        self.streams.lock().insert(stream_id, payload_tx);

        if self.outbound.send(Frame::syn(stream_id)).await.is_err() {
            self.streams.lock().remove(&stream_id);
            return Err(closed_err());
        }

        Ok(Stream::new(stream_id, payload_rx, self.outbound.clone()))
    }

    /// Accepts the next stream opened by the remote side.
    pub async fn accept(&self) -> io::Result<Stream> {
        if self.is_closed() {
            return Err(closed_err());
        }
        let mut queue = self.accept_queue.lock().await;
        queue.recv().await.ok_or_else(closed_err)
    }

    /// Shuts the session down, invalidating all outstanding streams.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Checks whether the session has been shut down or lost its transport.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "the session is closed")
}

/// Drains locally produced frames into the transport. A write failure brings
/// the whole session down.
async fn write_loop<W, E>(
    mut framed: W,
    mut outbound_rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) where
    W: futures::Sink<Frame, Error = E> + Unpin,
    E: std::fmt::Display,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = outbound_rx.recv() => {
                let frame = match frame {
                    Some(frame) => frame,
                    None => break,
                };
                if let Err(e) = framed.send(frame).await {
                    trace!("session write failed: {e}");
                    break;
                }
            }
        }
    }

    shutdown.cancel();
}

/// Owns all reads from the transport; routes frame payloads to the streams
/// they belong to and queues remotely opened streams for acceptance.
async fn demux_loop<R>(
    mut framed: R,
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>>,
    accept_tx: mpsc::Sender<Stream>,
    outbound: mpsc::Sender<Frame>,
    side: SessionSide,
    shutdown: CancellationToken,
) where
    R: futures::Stream<Item = io::Result<Frame>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    trace!("session read failed: {e}");
                    break;
                }
                None => break,
            },
        };

        match frame.kind {
            FrameKind::Syn => {
                // The remote side must only open IDs of its own parity.
                let remote_parity = match !side {
                    SessionSide::Client => 1,
                    SessionSide::Server => 0,
                };
                if frame.stream_id % 2 != remote_parity || streams.lock().contains_key(&frame.stream_id) {
                    trace!("protocol violation: bad SYN for stream {}", frame.stream_id);
                    break;
                }

                let (payload_tx, payload_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
                streams.lock().insert(frame.stream_id, payload_tx);
                let stream = Stream::new(frame.stream_id, payload_rx, outbound.clone());

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = accept_tx.send(stream) => if res.is_err() {
                        // The session handle is gone; nobody can accept.
                        break;
                    }
                }
            }
            FrameKind::Data => {
                let route = streams.lock().get(&frame.stream_id).cloned();
                let Some(route) = route else {
                    // Data racing a locally dropped stream; ignore it.
                    continue;
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = route.send(frame.payload) => if res.is_err() {
                        streams.lock().remove(&frame.stream_id);
                    }
                }
            }
            FrameKind::Fin => {
                // Dropping the route sender makes the stream read EOF once
                // its buffered payloads are drained.
                streams.lock().remove(&frame.stream_id);
            }
        }
    }

    shutdown.cancel();
    streams.lock().clear();
}
