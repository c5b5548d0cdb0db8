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
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::sync::PollSender;

use crate::{frame::Frame, MAX_FRAME_PAYLOAD};

/// One independent, bidirectional byte pipe inside a session.
///
/// Bytes within a stream are ordered; nothing is guaranteed across streams.
/// Reads return EOF once the remote side half-closes the stream or the
/// session goes away; writes fail once the session goes away.
pub struct Stream {
    stream_id: u32,
    /// Payloads routed to this stream by the session's demuxer.
    payload_rx: mpsc::Receiver<Bytes>,
    /// The portion of the last payload not yet copied out.
    leftover: Bytes,
    /// Outbound frames, shared with every other stream on the session.
    writer: PollSender<Frame>,
    /// A plain handle on the same queue, for the half-close on drop.
    writer_raw: mpsc::Sender<Frame>,
    fin_sent: bool,
}

impl Stream {
    pub(crate) fn new(stream_id: u32, payload_rx: mpsc::Receiver<Bytes>, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            stream_id,
            payload_rx,
            leftover: Bytes::new(),
            writer: PollSender::new(outbound.clone()),
            writer_raw: outbound,
            fin_sent: false,
        }
    }

    /// Returns the stream's session-scoped identifier.
    pub fn id(&self) -> u32 {
        self.stream_id
    }
}

impl AsyncRead for Stream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            if !self.leftover.is_empty() {
                let n = self.leftover.len().min(buf.remaining());
                buf.put_slice(&self.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(self.payload_rx.poll_recv(cx)) {
                Some(payload) => self.leftover = payload,
                // The remote half-closed the stream, or the session is gone.
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        ready!(self.writer.poll_reserve(cx)).map_err(|_| closed_err())?;

        let n = buf.len().min(MAX_FRAME_PAYLOAD);
        let frame = Frame::data(self.stream_id, Bytes::copy_from_slice(&buf[..n]));
        self.writer.send_item(frame).map_err(|_| closed_err())?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed off to the session's writer task on submission.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fin_sent {
            return Poll::Ready(Ok(()));
        }

        ready!(self.writer.poll_reserve(cx)).map_err(|_| closed_err())?;
        let frame = Frame::fin(self.stream_id);
        self.writer.send_item(frame).map_err(|_| closed_err())?;
        self.fin_sent = true;

        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.fin_sent {
            // Best-effort half-close; the queue being full or closed means
            // the session is going away anyway.
            let _ = self.writer_raw.try_send(Frame::fin(self.stream_id));
        }
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "the session is closed")
}
