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

//! The RPC dispatcher.
//!
//! Every substream on a peer's session carries one RPC: a framed name
//! followed by an application-defined conversation. Inbound substreams are
//! serviced by the per-peer handler task; outbound calls open a fresh
//! substream per invocation, so concurrent calls to one peer never serialize
//! on each other.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use cobalt_mux::{Session, Stream};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::*;

use crate::{
    bandwidth::{Limited, RateLimit},
    codec::{read_object, write_object},
    Error,
    Gateway,
    NetAddress,
    Result,
    MAX_ENCODED_RPC_NAME_LENGTH,
};

/// The longest RPC name accepted by [`Gateway::register_rpc`].
const MAX_RPC_NAME_LENGTH: usize = 48;

/// The connection handed to an RPC handler: one substream of the peer's
/// session, wrapped in the per-gateway and the process-global rate limits,
/// plus the peer's address.
pub struct PeerConn {
    stream: Limited<Stream>,
    remote_addr: NetAddress,
}

impl PeerConn {
    fn new(stream: Stream, remote_addr: NetAddress, limits: Vec<Arc<RateLimit>>) -> Self {
        Self { stream: Limited::new(stream, limits), remote_addr }
    }

    /// Returns the address of the peer on the other end of the substream.
    pub fn remote_addr(&self) -> &NetAddress {
        &self.remote_addr
    }
}

impl AsyncRead for PeerConn {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeerConn {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A registered RPC handler.
pub(crate) type RpcFunc = Arc<dyn Fn(PeerConn) -> BoxFuture<'static, Result<()>> + Send + Sync>;

impl Gateway {
    /// Registers a handler for the named RPC, replacing any previous one.
    ///
    /// # Panics
    ///
    /// Panics if the name is empty or longer than 48 bytes.
    pub fn register_rpc<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(PeerConn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        assert!(!name.is_empty() && name.len() <= MAX_RPC_NAME_LENGTH, "invalid rpc name {name:?}");
        self.rpcs
            .write()
            .insert(name.into(), Arc::new(move |conn| -> BoxFuture<'static, Result<()>> { Box::pin(handler(conn)) }));
    }

    /// Registers an RPC to be invoked, in its own task, against every newly
    /// connected outbound peer.
    ///
    /// # Panics
    ///
    /// Panics if the name is empty or longer than 48 bytes.
    pub fn register_connect_call<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(PeerConn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        assert!(!name.is_empty() && name.len() <= MAX_RPC_NAME_LENGTH, "invalid rpc name {name:?}");
        self.init_rpcs
            .write()
            .insert(name.into(), Arc::new(move |conn| -> BoxFuture<'static, Result<()>> { Box::pin(handler(conn)) }));
    }

    /// Calls the named RPC on the given peer: opens a fresh substream,
    /// writes the name, and hands the substream to `f`.
    pub async fn rpc<F, Fut>(&self, addr: NetAddress, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(PeerConn) -> Fut,
        Fut: Future<Output = Result<()>> + Send,
    {
        let _guard = self.barrier.register()?;
        self.managed_rpc(addr, name, f).await
    }

    async fn managed_rpc<F, Fut>(&self, addr: NetAddress, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(PeerConn) -> Fut,
        Fut: Future<Output = Result<()>> + Send,
    {
        let (sess, rl) = {
            let state = self.state.read();
            let peer = state.peers.get(&addr).ok_or(Error::NotConnected)?;
            (peer.sess.clone(), peer.rl.clone())
        };

        let mut stream = sess.open().await.map_err(Error::io("failed to open an rpc stream"))?;
        write_object(&mut stream, name).await?;

        let conn = PeerConn::new(stream, addr, vec![rl, self.limits.global.clone()]);
        f(conn).await
    }

    /// Invokes every registered init RPC against the freshly connected
    /// outbound peer, one task each.
    pub(crate) fn call_init_rpcs(&self, addr: NetAddress) {
        let init_rpcs: Vec<(String, RpcFunc)> =
            self.init_rpcs.read().iter().map(|(name, f)| (name.clone(), f.clone())).collect();

        for (name, f) in init_rpcs {
            let gateway = self.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                let Ok(_guard) = gateway.barrier.register() else {
                    return;
                };
                if let Err(e) = gateway.managed_rpc(addr.clone(), &name, move |conn| f(conn)).await {
                    debug!(parent: &gateway.span, "init rpc {name:?} on peer {addr} failed: {e}");
                }
            });
        }
    }

    /// Services a peer's session: accepts inbound substreams and dispatches
    /// each to its registered handler. Owned by the peer from `add_peer`
    /// until the session dies or shutdown begins.
    pub(crate) async fn listen_peer(self, addr: NetAddress, sess: Arc<Session>, rl: Arc<RateLimit>) {
        let Ok(_guard) = self.barrier.register() else {
            // Shutdown owns the remaining peers; exit without closing.
            return;
        };

        let stop = self.barrier.stop_signal();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = sess.accept() => match accepted {
                    Ok(stream) => {
                        let gateway = self.clone();
                        let addr = addr.clone();
                        let rl = rl.clone();
                        tokio::spawn(async move {
                            let Ok(_guard) = gateway.barrier.register() else {
                                return;
                            };
                            gateway.handle_inbound_rpc(stream, addr, rl).await;
                        });
                    }
                    Err(e) => {
                        trace!(parent: &self.span, "the session with {addr} ended: {e}");
                        break;
                    }
                }
            }
        }

        // The session is dead or we are shutting down; in either case the
        // peer leaves the table and the connection goes with it. The node
        // table entry stays so the peer can be re-dialed.
        sess.close();
        self.remove_peer_if_session(&addr, &sess);
    }

    async fn handle_inbound_rpc(&self, mut stream: Stream, addr: NetAddress, rl: Arc<RateLimit>) {
        let name: String = match read_object(&mut stream, MAX_ENCODED_RPC_NAME_LENGTH).await {
            Ok(name) => name,
            Err(e) => {
                debug!(parent: &self.span, "failed to read an rpc name from peer {addr}: {e}");
                return;
            }
        };

        let handler = self.rpcs.read().get(&name).cloned();
        let Some(handler) = handler else {
            debug!(parent: &self.span, "peer {addr} requested unknown rpc {name:?}");
            let _ = write_object(&mut stream, &Error::UnknownRpc(name).to_string()).await;
            return;
        };

        trace!(parent: &self.span, "handling rpc {name:?} from peer {addr}");
        let conn = PeerConn::new(stream, addr.clone(), vec![rl, self.limits.global.clone()]);
        if let Err(e) = handler(conn).await {
            debug!(parent: &self.span, "rpc {name:?} from peer {addr} failed: {e}");
        }
    }
}
