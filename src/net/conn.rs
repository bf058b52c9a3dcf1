//! Per-connection state

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::MessageBase;
use crate::net::stream::StreamKind;
use crate::net::wire::WireProtocol;

/// Messages a connection will queue before the bus starts dropping.
pub const SENDMSG_QUEUE_LEN: usize = 1024;

/// Stable identity of a connection. Handed to tasks and subscribers instead
/// of an fd so a recycled descriptor can never alias a live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnState {
    Init,
    Connecting,
    Connected,
    Disconnecting,
    Close,
}

/// Low-priority local links fall back to the peer's accepted link when that
/// one is healthier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkPriority {
    Low,
    High,
}

#[derive(Default)]
struct MetricNames {
    last_sent: String,
    last_ok: String,
    last_fail: String,
}

/// Send-side counters for one connection.
#[derive(Default)]
pub struct SendMetrics {
    send_sum: AtomicU64,
    send_max_size: AtomicU64,
    err_code: AtomicI32,
    names: Mutex<MetricNames>,
}

impl SendMetrics {
    pub fn note_sent(&self, name: &str) {
        self.names.lock().last_sent = name.to_string();
    }

    pub fn note_ok(&self, frame_len: usize) {
        self.send_sum.fetch_add(1, Ordering::Relaxed);
        self.send_max_size
            .fetch_max(frame_len as u64, Ordering::Relaxed);
        let mut names = self.names.lock();
        names.last_ok = names.last_sent.clone();
    }

    pub fn note_fail(&self, err_code: i32) {
        self.err_code.store(err_code, Ordering::Relaxed);
        let mut names = self.names.lock();
        names.last_fail = names.last_sent.clone();
    }

    pub fn send_sum(&self) -> u64 {
        self.send_sum.load(Ordering::Relaxed)
    }

    pub fn send_max_size(&self) -> u64 {
        self.send_max_size.load(Ordering::Relaxed)
    }

    pub fn err_code(&self) -> i32 {
        self.err_code.load(Ordering::Relaxed)
    }

    pub fn set_err_code(&self, code: i32) {
        self.err_code.store(code, Ordering::Relaxed);
    }

    /// Zeroes the counters after a metrics report; the names stick around.
    pub fn refresh(&self) {
        self.send_sum.store(0, Ordering::Relaxed);
        self.send_max_size.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, id: ConnId, to: &str) -> LinkMetricsSnapshot {
        let names = self.names.lock();
        LinkMetricsSnapshot {
            id: id.0,
            to: to.to_string(),
            err_code: self.err_code(),
            send_sum: self.send_sum(),
            send_max_size: self.send_max_size(),
            last_ok_msg: names.last_ok.clone(),
            last_fail_msg: names.last_fail.clone(),
        }
    }
}

/// Point-in-time copy of one link's send metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMetricsSnapshot {
    pub id: u64,
    pub to: String,
    pub err_code: i32,
    pub send_sum: u64,
    pub send_max_size: u64,
    pub last_ok_msg: String,
    pub last_fail_msg: String,
}

/// State shared with the connection's reader and writer tasks.
pub(crate) struct ConnShared {
    protocol: AtomicU8,
    /// Recycle scans since the last traffic on this connection.
    pub no_comm_time: AtomicU32,
    /// Body bytes enqueued but not yet on the wire.
    pub out_buffer: AtomicU64,
    pub metrics: SendMetrics,
}

impl ConnShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            protocol: AtomicU8::new(WireProtocol::Unknown as u8),
            no_comm_time: AtomicU32::new(0),
            out_buffer: AtomicU64::new(0),
            metrics: SendMetrics::default(),
        })
    }

    pub fn protocol(&self) -> WireProtocol {
        WireProtocol::from_u8(self.protocol.load(Ordering::Acquire))
    }

    pub fn set_protocol(&self, protocol: WireProtocol) {
        self.protocol.store(protocol as u8, Ordering::Release);
    }

    pub fn mark_traffic(&self) {
        self.no_comm_time.store(0, Ordering::Relaxed);
    }
}

/// A registry entry bound to one peer socket.
pub(crate) struct Connection {
    pub id: ConnId,
    /// Our advertised url.
    pub from: String,
    /// Peer url; empty on an accepted connection until its first message.
    pub to: String,
    pub peer: Option<SocketAddr>,
    pub is_remote: bool,
    /// Exit notifications for this link were already synthesized.
    pub is_exited: bool,
    /// Torn down by the idle recycler.
    pub timeout_removed: bool,
    pub kind: StreamKind,
    pub state: ConnState,
    pub priority: LinkPriority,
    pub queue: mpsc::Sender<MessageBase>,
    /// Receiver side of the queue, handed to the writer task once the
    /// stream is established.
    pub pending_rx: Option<mpsc::Receiver<MessageBase>>,
    pub shared: Arc<ConnShared>,
    /// Connect/reader/writer tasks; aborted on close.
    pub io_tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    pub fn new(id: ConnId, from: String, to: String, is_remote: bool, kind: StreamKind) -> Self {
        let (queue, rx) = mpsc::channel(SENDMSG_QUEUE_LEN);
        Self {
            id,
            from,
            to,
            peer: None,
            is_remote,
            is_exited: false,
            timeout_removed: false,
            kind,
            state: ConnState::Init,
            priority: LinkPriority::High,
            queue,
            pending_rx: Some(rx),
            shared: ConnShared::new(),
            io_tasks: Vec::new(),
        }
    }

    /// Messages currently buffered in the send queue.
    pub fn queued(&self) -> usize {
        SENDMSG_QUEUE_LEN - self.queue.capacity()
    }

    pub fn abort_io(&mut self) {
        for task in self.io_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Public view of one connection, surfaced by the transport's stats call.
#[derive(Debug, Clone, Serialize)]
pub struct ConnStat {
    pub id: u64,
    pub to: String,
    pub peer: Option<SocketAddr>,
    pub is_remote: bool,
    pub kind: StreamKind,
    pub state: ConnState,
    pub protocol: WireProtocol,
    pub queued: usize,
    pub send_sum: u64,
    pub send_max_size: u64,
}
