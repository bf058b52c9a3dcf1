//! TCP transport manager
//!
//! Owns the listening socket, the receive and send event loops, and the
//! link registry. Connection lifecycle (accept, connect, close) is
//! serialized on the receive loop; enqueue and routing decisions on the
//! send loop. Both sides meet only at the registry mutex, which is always
//! taken inside a loop closure or an I/O task and never held across an
//! await.

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aid::Aid;
use crate::config::BusConfig;
use crate::config::ResolvedConfig;
use crate::error::BusError;
use crate::event::EventLoop;
use crate::message::MessageBase;
use crate::net::conn::{
    ConnId, ConnShared, ConnState, ConnStat, Connection, LinkMetricsSnapshot, LinkPriority,
    SENDMSG_QUEUE_LEN,
};
use crate::net::link::{ClosedConn, LinkRegistry};
use crate::net::stream::{
    accept_stream, bind_listener, configure_socket, connect_stream, resolve_url, split_url,
    BusStream, StreamKind, TlsContext,
};
use crate::net::wire::{classify, encode_frame, KmsgDecoder, WireProtocol};

/// Ingress callback supplied by the actor scheduler. Takes ownership of
/// every parsed message, exit notifications included.
pub type MsgHandler = Arc<dyn Fn(MessageBase) + Send + Sync + 'static>;

/// Hook for the pluggable HTTP decoder. Streams classified as HTTP hand
/// their raw bytes here; without a registered decoder they are torn down.
pub trait HttpCallbacks: Send + Sync {
    fn on_request(&self, conn: ConnId, data: &[u8]);
    fn on_response(&self, conn: ConnId, data: &[u8]);
}

/// Frames parsed back to back before the reader yields to its peers.
const MAX_RECV_BURST: usize = 3;

/// Idle HTTP links recycled per scan.
const MAX_RECYCLE_LINK_COUNT: usize = 10;

const RECV_LOOP_NAME: &str = "litebus-tcp-recv";
const SEND_LOOP_NAME: &str = "litebus-tcp-send";

/// Send-metrics report: the busiest link by send count and, when different,
/// the link with the largest single send.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsReport {
    pub max_send: Option<LinkMetricsSnapshot>,
    pub max_size: Option<LinkMetricsSnapshot>,
}

impl MetricsReport {
    pub fn is_empty(&self) -> bool {
        self.max_send.is_none() && self.max_size.is_none()
    }

    pub(crate) fn log(&self) {
        fn or_null(s: &str) -> &str {
            if s.is_empty() {
                "null"
            } else {
                s
            }
        }
        for snap in [&self.max_send, &self.max_size].into_iter().flatten() {
            debug!(
                "[format:id-err-sum-size|to-okmsg-failmsg][value:{}-{}-{}-{}|{}-{}-{}]",
                snap.id,
                snap.err_code,
                snap.send_sum,
                snap.send_max_size,
                or_null(&snap.to),
                or_null(&snap.last_ok_msg),
                or_null(&snap.last_fail_msg),
            );
        }
    }
}

struct Inner {
    config: ResolvedConfig,
    recv_loop: EventLoop,
    send_loop: EventLoop,
    registry: Mutex<LinkRegistry>,
    handler: RwLock<Option<MsgHandler>>,
    http_callbacks: RwLock<Option<Arc<dyn HttpCallbacks>>>,
    advertise_url: RwLock<String>,
    server_addr: RwLock<Option<SocketAddr>>,
    tls: Option<TlsContext>,
    out_buf_size: AtomicU64,
    next_conn_id: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl Inner {
    fn alloc_conn_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<Inner>,
}

impl TransportManager {
    /// Builds the manager and starts both event loops. Must run inside a
    /// tokio runtime.
    pub fn init(config: BusConfig) -> Self {
        let config = config.resolve();
        let tls = config.tls.as_ref().map(TlsContext::new);
        let inner = Arc::new(Inner {
            registry: Mutex::new(LinkRegistry::new(config.double_link)),
            config,
            recv_loop: EventLoop::spawn(RECV_LOOP_NAME),
            send_loop: EventLoop::spawn(SEND_LOOP_NAME),
            handler: RwLock::new(None),
            http_callbacks: RwLock::new(None),
            advertise_url: RwLock::new(String::new()),
            server_addr: RwLock::new(None),
            tls,
            out_buf_size: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(0),
            accept_task: Mutex::new(None),
            finished: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Binds and listens on `url` and publishes `advertise_url` as our
    /// identity in outbound frames. An empty advertise url falls back to
    /// the bound address, which also resolves port 0 binds.
    pub async fn start_server(&self, url: &str, advertise_url: &str) -> Result<SocketAddr, BusError> {
        if self.inner.accept_task.lock().is_some() {
            return Err(BusError::ServerStart("already listening".into()));
        }
        let addr = resolve_url(url).await?;
        let listener = bind_listener(addr).map_err(|err| {
            error!(url, %err, "listen failed");
            BusError::ServerStart(err.to_string())
        })?;
        let bound = listener.local_addr()?;
        let advertise = if advertise_url.is_empty() {
            bound.to_string()
        } else {
            match split_url(advertise_url) {
                Ok(_) => strip_protocol(advertise_url).to_string(),
                Err(err) => return Err(err),
            }
        };
        *self.inner.advertise_url.write() = advertise.clone();
        *self.inner.server_addr.write() = Some(bound);
        let task = tokio::spawn(accept_loop(self.inner.clone(), listener));
        *self.inner.accept_task.lock() = Some(task);
        info!(url, %bound, %advertise, "server started");
        Ok(bound)
    }

    pub fn register_msg_handler(&self, handler: MsgHandler) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn register_http_callbacks(&self, callbacks: Arc<dyn HttpCallbacks>) {
        *self.inner.http_callbacks.write() = Some(callbacks);
    }

    /// Routes a message to the link serving `msg.to`.
    ///
    /// `remote_link` prefers the peer-accepted link; `exact_not_remote`
    /// restricts the lookup to locally initiated links. The actual work
    /// runs on the send loop: the link is found or created there, and
    /// messages racing a close are retried once through the receive loop so
    /// the close settles first.
    pub fn send(
        &self,
        msg: MessageBase,
        remote_link: bool,
        exact_not_remote: bool,
    ) -> Result<(), BusError> {
        let inner = self.inner.clone();
        self.inner
            .send_loop
            .schedule(move || send_task(&inner, msg, remote_link, exact_not_remote, false))
    }

    /// Subscribes `from` to the fate of the link towards `to`. The peer
    /// connection is created on demand; a failure to even create it
    /// surfaces as an immediate exit notification.
    pub fn link(&self, from: Aid, to: Aid) -> Result<(), BusError> {
        let inner = self.inner.clone();
        self.inner.recv_loop.schedule(move || {
            let to_url = to.url().to_string();
            let mut evicted = None;
            let linked = {
                let mut reg = inner.registry.lock();
                let found = reg.find_link(&to_url, false, inner.config.double_link);
                let cid = match found {
                    Some(id) => Some(id),
                    None => {
                        info!(%from, %to, "link: no existing connection, connecting");
                        match new_outbound(&inner, &mut reg, &to_url) {
                            Ok((id, closed)) => {
                                evicted = closed;
                                Some(id)
                            }
                            Err(err) => {
                                error!(%from, %to, %err, "link: connect failed");
                                None
                            }
                        }
                    }
                };
                if let Some(id) = cid {
                    reg.add_linker(id, from.clone(), to.clone());
                    info!(conn = %id, %from, %to, "link");
                }
                cid
            };
            finish_closed(&inner, evicted);
            if linked.is_none() {
                send_exit(&inner, &from, &to);
            }
        })
    }

    /// Closes the link(s) towards `to`, notifying every subscriber. In
    /// single-link mode the locally initiated and the accepted connection
    /// are one logical link, so both close.
    pub fn unlink(&self, to: Aid) -> Result<(), BusError> {
        let inner = self.inner.clone();
        self.inner.recv_loop.schedule(move || {
            let to_url = to.url().to_string();
            let mut all = Vec::new();
            {
                let mut reg = inner.registry.lock();
                let sides: &[bool] = if inner.config.double_link {
                    &[false]
                } else {
                    &[false, true]
                };
                for &remote in sides {
                    if let Some(id) = reg.exact_find(&to_url, remote) {
                        info!(conn = %id, %to, remote, "unlink");
                        if let Some(closed) = reg.close_connection(id) {
                            all.push(closed);
                        }
                    } else {
                        debug!(%to, remote, "unlink: link not found");
                    }
                }
            }
            for closed in all {
                finish_closed(&inner, Some(closed));
            }
        })
    }

    /// Tears the link towards `to` down and dials it again, moving every
    /// linker subscription onto the replacement connection.
    pub fn reconnect(&self, from: Aid, to: Aid) -> Result<(), BusError> {
        let inner = self.inner.clone();
        self.inner.send_loop.schedule(move || {
            let to_url = to.url().to_string();
            {
                let mut reg = inner.registry.lock();
                if let Some(id) = reg.find_link(&to_url, false, inner.config.double_link) {
                    if let Some(conn) = reg.conn_mut(id) {
                        conn.state = ConnState::Close;
                    }
                }
            }
            let inner2 = inner.clone();
            if inner
                .recv_loop
                .schedule(move || reconnect_task(&inner2, from, to))
                .is_err()
            {
                warn!("reconnect: receive loop stopped");
            }
        })
    }

    /// Snapshot of the busiest links, collected on the send loop. Resets
    /// the per-link counters afterwards.
    pub async fn collect_metrics(&self) -> Result<MetricsReport, BusError> {
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        self.inner.send_loop.schedule(move || {
            let reg = inner.registry.lock();
            let max_id = reg.find_max_link();
            let max_send = max_id
                .and_then(|id| reg.conn(id))
                .map(|conn| conn.shared.metrics.snapshot(conn.id, &conn.to));
            let max_size = reg
                .find_fast_link()
                .filter(|id| Some(*id) != max_id)
                .and_then(|id| reg.conn(id))
                .map(|conn| conn.shared.metrics.snapshot(conn.id, &conn.to));
            reg.refresh_metrics();
            let _ = tx.send(MetricsReport { max_send, max_size });
        })?;
        rx.await.map_err(|_| BusError::LoopStopped)
    }

    /// Ages every HTTP-classified remote link by one scan and closes the
    /// ones idle past `period` scans, at most [`MAX_RECYCLE_LINK_COUNT`]
    /// per call.
    pub fn link_recycle_check(&self, period: u32) -> Result<(), BusError> {
        let inner = self.inner.clone();
        self.inner.recv_loop.schedule(move || {
            let mut all = Vec::new();
            {
                let mut reg = inner.registry.lock();
                let mut recycled = 0;
                for id in reg.http_remote_ids() {
                    let Some(conn) = reg.conn(id) else { continue };
                    let idle = conn.shared.no_comm_time.fetch_add(1, Ordering::Relaxed) + 1;
                    if idle > period && recycled < MAX_RECYCLE_LINK_COUNT {
                        warn!(conn = %id, to = %conn.to, peer = ?conn.peer, "recycling idle http link");
                        reg.remove_http_remote(id);
                        if let Some(conn) = reg.conn_mut(id) {
                            conn.timeout_removed = true;
                            conn.state = ConnState::Disconnecting;
                        }
                        if let Some(closed) = reg.close_connection(id) {
                            all.push(closed);
                        }
                        recycled += 1;
                    }
                }
            }
            for closed in all {
                finish_closed(&inner, Some(closed));
            }
        })
    }

    /// Body bytes accepted for sending but not yet on the wire.
    pub fn out_buf_size(&self) -> u64 {
        self.inner.out_buf_size.load(Ordering::Relaxed)
    }

    pub fn metrics_interval(&self) -> std::time::Duration {
        self.inner.config.metrics_interval
    }

    pub fn link_recycle_period(&self) -> Option<u32> {
        self.inner.config.link_recycle_period
    }

    pub fn double_link(&self) -> bool {
        self.inner.config.double_link
    }

    pub fn advertise_url(&self) -> String {
        self.inner.advertise_url.read().clone()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        *self.inner.server_addr.read()
    }

    pub fn stats(&self) -> Vec<ConnStat> {
        self.inner.registry.lock().stats()
    }

    /// Stops the loops and drops every connection. Idempotent; no exit
    /// notifications are synthesized on final teardown.
    pub async fn finish(&self) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        self.inner.send_loop.finish().await;
        self.inner.recv_loop.finish().await;
        let mut entries = self.inner.registry.lock().drain_all();
        for entry in &mut entries {
            entry.abort_io();
        }
        info!(closed = entries.len(), "transport finished");
    }
}

fn strip_protocol(url: &str) -> &str {
    match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url,
    }
}

// =============================================================================
// ACCEPT PATH
// =============================================================================

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(err) = configure_socket(&stream) {
                    warn!(%peer, %err, "socket options failed");
                }
                let inner2 = inner.clone();
                if inner
                    .recv_loop
                    .schedule(move || register_accepted(&inner2, stream, peer))
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Registers and counts the connection before a single handshake byte is
/// read, so a peer stalling the handshake holds a counted slot instead of
/// an invisible task.
fn register_accepted(inner: &Arc<Inner>, stream: TcpStream, peer: SocketAddr) {
    let mut reg = inner.registry.lock();
    if reg.remote_link_count() >= inner.config.remote_link_max {
        error!(%peer, cap = inner.config.remote_link_max, "remote link overrun");
        return;
    }
    let id = inner.alloc_conn_id();
    let kind = if inner.tls.is_some() {
        StreamKind::Tls
    } else {
        StreamKind::Tcp
    };
    let mut entry = Connection::new(
        id,
        inner.advertise_url.read().clone(),
        String::new(),
        true,
        kind,
    );
    entry.peer = Some(peer);
    entry.state = ConnState::Connecting;
    entry
        .io_tasks
        .push(tokio::spawn(accept_handshake_task(inner.clone(), id, stream)));
    reg.add_accepted(entry);
    info!(conn = %id, %peer, "accepted connection");
}

/// Drives the inbound handshake against the already-registered entry.
async fn accept_handshake_task(inner: Arc<Inner>, id: ConnId, stream: TcpStream) {
    match accept_stream(stream, inner.tls.as_ref()).await {
        Ok(stream) => {
            let inner2 = inner.clone();
            let _ = inner
                .recv_loop
                .schedule(move || on_accept_established(&inner2, id, stream));
        }
        Err(err) => {
            debug!(conn = %id, %err, "inbound handshake failed");
            schedule_disconnect(&inner, id, err.raw_os_error().unwrap_or(0));
        }
    }
}

fn on_accept_established(inner: &Arc<Inner>, id: ConnId, stream: BusStream) {
    let closed = {
        let mut reg = inner.registry.lock();
        match reg.conn(id).map(|conn| conn.state) {
            Some(ConnState::Connecting) => {
                if let Some(conn) = reg.conn_mut(id) {
                    debug!(conn = %id, "inbound handshake complete");
                    spawn_io(inner, conn, stream);
                }
                None
            }
            Some(_) => {
                // closed or recycled while the handshake was in flight
                reg.close_connection(id)
            }
            None => None,
        }
    };
    finish_closed(inner, closed);
}

// =============================================================================
// CONNECT PATH
// =============================================================================

/// Allocates a locally initiated connection towards `to_url` and starts the
/// dial. The url must at least parse; resolution and the handshake run
/// asynchronously and report back through the receive loop.
fn new_outbound(
    inner: &Arc<Inner>,
    reg: &mut LinkRegistry,
    to_url: &str,
) -> Result<(ConnId, Option<ClosedConn>), BusError> {
    split_url(to_url)?;
    let id = inner.alloc_conn_id();
    let kind = if inner.tls.is_some() {
        StreamKind::Tls
    } else {
        StreamKind::Tcp
    };
    let mut entry = Connection::new(
        id,
        inner.advertise_url.read().clone(),
        to_url.to_string(),
        false,
        kind,
    );
    entry.state = ConnState::Connecting;
    entry
        .io_tasks
        .push(tokio::spawn(connect_task(inner.clone(), id, to_url.to_string())));
    let closed = reg.add_link(entry);
    Ok((id, closed))
}

async fn connect_task(inner: Arc<Inner>, id: ConnId, to_url: String) {
    let result = async {
        let (host, _) = split_url(&to_url)?;
        let addr = resolve_url(&to_url).await?;
        let stream = connect_stream(addr, &host, inner.tls.as_ref()).await?;
        Ok::<_, BusError>(stream)
    }
    .await;
    match result {
        Ok(stream) => {
            let inner2 = inner.clone();
            let _ = inner
                .recv_loop
                .schedule(move || on_connect_established(&inner2, id, stream));
        }
        Err(err) => {
            debug!(conn = %id, to = %to_url, %err, "connect failed");
            let errno = match &err {
                BusError::Io(io) => io.raw_os_error().unwrap_or(0),
                _ => 0,
            };
            schedule_disconnect(&inner, id, errno);
        }
    }
}

fn on_connect_established(inner: &Arc<Inner>, id: ConnId, stream: BusStream) {
    let closed = {
        let mut reg = inner.registry.lock();
        match reg.conn(id).map(|conn| conn.state) {
            Some(ConnState::Connecting) => {
                let peer = stream.peer_addr().ok();
                if let Some(conn) = reg.conn_mut(id) {
                    conn.peer = peer;
                    conn.state = ConnState::Connected;
                    debug!(conn = %id, to = %conn.to, "connect succ");
                    spawn_io(inner, conn, stream);
                }
                None
            }
            Some(_) => {
                // a close raced the dial; finish the close instead
                reg.close_connection(id)
            }
            None => None,
        }
    };
    finish_closed(inner, closed);
}

fn spawn_io(inner: &Arc<Inner>, entry: &mut Connection, stream: BusStream) {
    let (read, write) = tokio::io::split(stream);
    let shared = entry.shared.clone();
    entry.io_tasks.push(tokio::spawn(run_reader(
        inner.clone(),
        entry.id,
        read,
        shared.clone(),
        entry.is_remote,
    )));
    if let Some(rx) = entry.pending_rx.take() {
        entry
            .io_tasks
            .push(tokio::spawn(run_writer(inner.clone(), entry.id, write, rx, shared)));
    }
}

// =============================================================================
// SEND PATH
// =============================================================================

enum SendAction {
    Done,
    Reroute(MessageBase),
}

fn send_task(
    inner: &Arc<Inner>,
    msg: MessageBase,
    remote_link: bool,
    exact_not_remote: bool,
    rerouted: bool,
) {
    let mut evicted = None;
    let action = {
        let mut reg = inner.registry.lock();
        plan_send(inner, &mut reg, &mut evicted, msg, remote_link, exact_not_remote, rerouted)
    };
    finish_closed(inner, evicted);
    if let SendAction::Reroute(msg) = action {
        // let the receive loop settle the close first, then retry there
        let inner2 = inner.clone();
        if inner
            .recv_loop
            .schedule(move || send_task(&inner2, msg, remote_link, exact_not_remote, true))
            .is_err()
        {
            debug!("send: receive loop stopped, message dropped");
        }
    }
}

fn plan_send(
    inner: &Arc<Inner>,
    reg: &mut LinkRegistry,
    evicted: &mut Option<ClosedConn>,
    msg: MessageBase,
    remote_link: bool,
    exact_not_remote: bool,
    rerouted: bool,
) -> SendAction {
    let exact = inner.config.double_link || exact_not_remote;
    let to_url = msg.to.url().to_string();
    let mut cid = match reg.find_link(&to_url, remote_link, exact) {
        Some(id) => id,
        None => {
            if remote_link && !exact {
                error!(name = %msg.name, to = %to_url, "send: remote link not found, message dropped");
                return SendAction::Done;
            }
            debug!(to = %to_url, "send: no existing link, connecting");
            match new_outbound(inner, reg, &to_url) {
                Ok((id, closed)) => {
                    *evicted = closed;
                    id
                }
                Err(err) => {
                    warn!(name = %msg.name, to = %to_url, %err, "send: connect failed, message dropped");
                    return SendAction::Done;
                }
            }
        }
    };
    let Some(conn) = reg.conn(cid) else {
        return SendAction::Done;
    };
    let (state, is_remote, priority) = (conn.state, conn.is_remote, conn.priority);
    if !rerouted {
        if state != ConnState::Connected && conn.queued() >= SENDMSG_QUEUE_LEN {
            warn!(name = %msg.name, conn = %cid, to = %to_url, "message dropped, send queue full");
            return SendAction::Done;
        }
        if matches!(state, ConnState::Close | ConnState::Disconnecting) {
            return SendAction::Reroute(msg);
        }
    }
    if !is_remote && !exact && priority == LinkPriority::Low {
        if let Some(rid) = reg.exact_find(&to_url, true) {
            if reg.conn(rid).map(|c| c.state) == Some(ConnState::Connected) {
                cid = rid;
            }
        }
    }
    let Some(conn) = reg.conn(cid) else {
        return SendAction::Done;
    };
    let queue = conn.queue.clone();
    let shared = conn.shared.clone();
    let body_len = msg.body.len() as u64;
    inner.out_buf_size.fetch_add(body_len, Ordering::Relaxed);
    shared.out_buffer.fetch_add(body_len, Ordering::Relaxed);
    match queue.try_send(msg) {
        Ok(()) => debug!(conn = %cid, to = %to_url, "send: message queued"),
        Err(mpsc::error::TrySendError::Full(msg)) => {
            warn!(name = %msg.name, conn = %cid, to = %to_url, "message dropped, send queue full");
            inner.out_buf_size.fetch_sub(body_len, Ordering::Relaxed);
            shared.out_buffer.fetch_sub(body_len, Ordering::Relaxed);
        }
        Err(mpsc::error::TrySendError::Closed(msg)) => {
            debug!(name = %msg.name, conn = %cid, "message dropped, link closing");
            inner.out_buf_size.fetch_sub(body_len, Ordering::Relaxed);
            shared.out_buffer.fetch_sub(body_len, Ordering::Relaxed);
        }
    }
    SendAction::Done
}

// =============================================================================
// RECONNECT
// =============================================================================

fn reconnect_task(inner: &Arc<Inner>, from: Aid, to: Aid) {
    let to_url = to.url().to_string();
    let mut all = Vec::new();
    let mut immediate_exits = Vec::new();
    {
        let mut reg = inner.registry.lock();
        match reg.find_link(&to_url, false, inner.config.double_link) {
            Some(old_id) => {
                let old_is_remote = reg.conn(old_id).map(|c| c.is_remote).unwrap_or(false);
                if !inner.config.double_link && !old_is_remote {
                    // rare case: a locally initiated and an accepted link coexist
                    if let Some(rid) = reg.exact_find(&to_url, true) {
                        if rid != old_id {
                            info!(conn = %rid, %to, "reconnect: closing accepted twin");
                            if let Some(closed) = reg.close_connection(rid) {
                                all.push(closed);
                            }
                        }
                    }
                }
                if let Some(mut entry) = reg.remove_preserving_linkers(old_id) {
                    info!(conn = %old_id, %from, %to, "reconnect: closing old connection");
                    entry.abort_io();
                    all.push(ClosedConn {
                        entry,
                        exits: Vec::new(),
                    });
                }
                match new_outbound(inner, &mut reg, &to_url) {
                    Ok((id, closed)) => {
                        if let Some(closed) = closed {
                            all.push(closed);
                        }
                        reg.swap_linkers(old_id, id);
                        reg.add_linker(id, from.clone(), to.clone());
                        info!(old = %old_id, new = %id, %from, %to, "reconnect");
                    }
                    Err(err) => {
                        error!(%from, %to, %err, "reconnect: connect failed");
                        immediate_exits = reg.take_linker_exits(old_id);
                    }
                }
            }
            None => match new_outbound(inner, &mut reg, &to_url) {
                Ok((id, closed)) => {
                    if let Some(closed) = closed {
                        all.push(closed);
                    }
                    reg.add_linker(id, from.clone(), to.clone());
                    info!(new = %id, %from, %to, "reconnect: fresh connection");
                }
                Err(err) => {
                    error!(%from, %to, %err, "reconnect: connect failed");
                }
            },
        }
    }
    for closed in all {
        finish_closed(inner, Some(closed));
    }
    for exit in immediate_exits {
        send_exit(inner, &exit.from, &exit.to);
    }
}

// =============================================================================
// READER / WRITER TASKS
// =============================================================================

async fn run_reader(
    inner: Arc<Inner>,
    id: ConnId,
    mut read: ReadHalf<BusStream>,
    shared: Arc<ConnShared>,
    is_remote: bool,
) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    // classify the stream from its first four bytes
    while buf.len() < 4 {
        match read.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(conn = %id, "peer closed before classification");
                schedule_disconnect(&inner, id, 0);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                schedule_disconnect(&inner, id, err.raw_os_error().unwrap_or(0));
                return;
            }
        }
    }
    let protocol = classify(&[buf[0], buf[1], buf[2], buf[3]]);
    shared.set_protocol(protocol);
    debug!(conn = %id, ?protocol, "stream classified");
    match protocol {
        WireProtocol::Kmsg => run_kmsg_reader(inner, id, read, buf, is_remote).await,
        WireProtocol::HttpReq | WireProtocol::HttpRsp => {
            if is_remote {
                inner.registry.lock().add_http_remote(id);
            }
            run_http_reader(inner, id, read, buf, shared, protocol).await
        }
        WireProtocol::Unknown => schedule_disconnect(&inner, id, 0),
    }
}

async fn run_kmsg_reader(
    inner: Arc<Inner>,
    id: ConnId,
    mut read: ReadHalf<BusStream>,
    mut buf: BytesMut,
    is_remote: bool,
) {
    let mut decoder = KmsgDecoder::new();
    loop {
        let mut burst = 0;
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(msg)) => {
                    if !deliver_kmsg(&inner, id, is_remote, msg) {
                        schedule_disconnect(&inner, id, 0);
                        return;
                    }
                    burst += 1;
                    if burst >= MAX_RECV_BURST {
                        burst = 0;
                        tokio::task::yield_now().await;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(conn = %id, %err, "frame rejected");
                    schedule_disconnect(&inner, id, 0);
                    return;
                }
            }
        }
        match read.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(conn = %id, "peer closed");
                schedule_disconnect(&inner, id, 0);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(conn = %id, %err, "read failed");
                schedule_disconnect(&inner, id, err.raw_os_error().unwrap_or(0));
                return;
            }
        }
    }
}

/// Finalizes one inbound message. Returns false when the connection must be
/// torn down.
fn deliver_kmsg(inner: &Arc<Inner>, id: ConnId, is_remote: bool, msg: MessageBase) -> bool {
    if !msg.from.ok() || !msg.to.ok() {
        error!(conn = %id, from = %msg.from, to = %msg.to, "invalid address in frame");
        return false;
    }
    if is_remote {
        let closed = {
            let mut reg = inner.registry.lock();
            if reg.conn(id).map(|c| c.to.is_empty()).unwrap_or(false) {
                let to_url = msg.from.url().to_string();
                if to_url.is_empty() {
                    None
                } else {
                    info!(conn = %id, to = %to_url, "remote link identified");
                    reg.bind_remote_url(id, &to_url)
                }
            } else {
                None
            }
        };
        finish_closed(inner, closed);
    }
    let handler = inner.handler.read().clone();
    match handler {
        Some(handler) => handler(msg),
        None => info!(conn = %id, "message handler not registered, message dropped"),
    }
    true
}

async fn run_http_reader(
    inner: Arc<Inner>,
    id: ConnId,
    mut read: ReadHalf<BusStream>,
    mut buf: BytesMut,
    shared: Arc<ConnShared>,
    protocol: WireProtocol,
) {
    loop {
        if !buf.is_empty() {
            shared.mark_traffic();
            let callbacks = inner.http_callbacks.read().clone();
            let Some(callbacks) = callbacks else {
                debug!(conn = %id, "no http decoder registered");
                schedule_disconnect(&inner, id, 0);
                return;
            };
            let data = buf.split();
            match protocol {
                WireProtocol::HttpRsp => callbacks.on_response(id, &data),
                _ => callbacks.on_request(id, &data),
            }
        }
        match read.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(conn = %id, "http peer closed");
                schedule_disconnect(&inner, id, 0);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                schedule_disconnect(&inner, id, err.raw_os_error().unwrap_or(0));
                return;
            }
        }
    }
}

fn sub_out_buf(inner: &Arc<Inner>, shared: &Arc<ConnShared>, body_len: u64) {
    inner.out_buf_size.fetch_sub(body_len, Ordering::Relaxed);
    shared.out_buffer.fetch_sub(body_len, Ordering::Relaxed);
}

async fn run_writer(
    inner: Arc<Inner>,
    id: ConnId,
    mut write: WriteHalf<BusStream>,
    mut rx: mpsc::Receiver<MessageBase>,
    shared: Arc<ConnShared>,
) {
    while let Some(msg) = rx.recv().await {
        shared.mark_traffic();
        let body_len = msg.body.len() as u64;
        shared.metrics.note_sent(&msg.name);
        let advertise = inner.advertise_url.read().clone();
        let head = match encode_frame(&msg, &advertise) {
            Ok(head) => head,
            Err(err) => {
                error!(conn = %id, name = %msg.name, %err, "unframeable message dropped");
                sub_out_buf(&inner, &shared, body_len);
                continue;
            }
        };
        let result = async {
            write.write_all(&head).await?;
            write.write_all(&msg.body).await?;
            write.flush().await
        }
        .await;
        sub_out_buf(&inner, &shared, body_len);
        match result {
            Ok(()) => {
                shared.metrics.note_ok(head.len() + msg.body.len());
                debug!(conn = %id, name = %msg.name, "send succ");
            }
            Err(err) => {
                shared.metrics.note_fail(err.raw_os_error().unwrap_or(0));
                debug!(conn = %id, name = %msg.name, %err, "send failed");
                schedule_disconnect(&inner, id, err.raw_os_error().unwrap_or(0));
                return;
            }
        }
    }
}

// =============================================================================
// TEARDOWN HELPERS
// =============================================================================

/// Marks a connection disconnecting where the failure was observed, then
/// finishes the close on the receive loop; the event-loop hop serializes it
/// against every other lifecycle op. Sends racing the close see the
/// DISCONNECTING state and reroute.
fn schedule_disconnect(inner: &Arc<Inner>, id: ConnId, errno: i32) {
    {
        let mut reg = inner.registry.lock();
        let Some(conn) = reg.conn_mut(id) else {
            return;
        };
        conn.state = ConnState::Disconnecting;
        if errno != 0 {
            conn.shared.metrics.set_err_code(errno);
        }
    }
    let inner2 = inner.clone();
    let result = inner.recv_loop.schedule(move || {
        let closed = inner2.registry.lock().close_connection(id);
        finish_closed(&inner2, closed);
    });
    if result.is_err() {
        debug!(conn = %id, "disconnect after loop stop");
    }
}

/// Aborts a closed connection's tasks, settles the outstanding-buffer
/// accounting, and delivers the exit notifications. Runs outside the
/// registry lock.
fn finish_closed(inner: &Arc<Inner>, closed: Option<ClosedConn>) {
    let Some(mut closed) = closed else {
        return;
    };
    closed.entry.abort_io();
    let pending = closed.entry.shared.out_buffer.swap(0, Ordering::Relaxed);
    if pending > 0 {
        inner.out_buf_size.fetch_sub(pending, Ordering::Relaxed);
    }
    info!(
        conn = %closed.entry.id,
        to = %closed.entry.to,
        remote = closed.entry.is_remote,
        freed = closed.entry.queued(),
        "connection closed"
    );
    for exit in closed.exits {
        send_exit(inner, &exit.from, &exit.to);
    }
}

fn send_exit(inner: &Arc<Inner>, from: &Aid, to: &Aid) {
    let handler = inner.handler.read().clone();
    if let Some(handler) = handler {
        debug!(%from, %to, "exit msg");
        handler(MessageBase::exit(from.clone(), to.clone()));
    }
}
