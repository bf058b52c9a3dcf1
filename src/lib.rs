//! litebus — in-process actor message bus
//!
//! Actors exchange named messages addressed by `name@ip:port`. Peers on
//! remote hosts are reached over persistent TCP (optionally TLS) links
//! carrying the KMSG wire format; link failures surface as exit
//! notifications to every subscriber of the dead link.
//!
//! [`Litebus`] wires the pieces together: the transport manager with its
//! receive and send loops, the timer service, and the system tickers.

pub mod aid;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod net;
pub mod sysmgr;
pub mod timer;

pub use aid::Aid;
pub use config::{BusConfig, TlsConfig};
pub use error::BusError;
pub use message::{MessageBase, MsgType};
pub use net::{
    ConnId, ConnStat, ConnState, HttpCallbacks, LinkMetricsSnapshot, MetricsReport, MsgHandler,
    TransportManager,
};
pub use timer::{Timer, TimerTools};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use sysmgr::SysMgr;
use tracing::info;

/// One bus instance: transport, timers, and system tickers.
///
/// Must be created and used inside a tokio runtime.
pub struct Litebus {
    transport: TransportManager,
    timers: TimerTools,
    sysmgr: SysMgr,
    finalized: AtomicBool,
}

impl Litebus {
    pub fn initialize(config: BusConfig) -> Self {
        info!("litebus starting");
        let timers = TimerTools::initialize();
        let transport = TransportManager::init(config);
        let sysmgr = SysMgr::spawn(transport.clone());
        info!("litebus started");
        Self {
            transport,
            timers,
            sysmgr,
            finalized: AtomicBool::new(false),
        }
    }

    /// Binds the server socket. `advertise_url` becomes our identity in
    /// outbound frames; empty means the bound address.
    pub async fn start_server(
        &self,
        url: &str,
        advertise_url: &str,
    ) -> Result<SocketAddr, BusError> {
        let probe = Aid::new("server", url);
        if !probe.ok() && probe.port() != 0 {
            return Err(BusError::InvalidAddress(url.to_string()));
        }
        self.transport.start_server(url, advertise_url).await
    }

    pub fn register_msg_handler(&self, handler: MsgHandler) {
        self.transport.register_msg_handler(handler);
    }

    pub fn send(
        &self,
        msg: MessageBase,
        remote_link: bool,
        exact_not_remote: bool,
    ) -> Result<(), BusError> {
        self.transport.send(msg, remote_link, exact_not_remote)
    }

    pub fn link(&self, from: Aid, to: Aid) -> Result<(), BusError> {
        self.transport.link(from, to)
    }

    pub fn unlink(&self, to: Aid) -> Result<(), BusError> {
        self.transport.unlink(to)
    }

    pub fn reconnect(&self, from: Aid, to: Aid) -> Result<(), BusError> {
        self.transport.reconnect(from, to)
    }

    pub fn transport(&self) -> &TransportManager {
        &self.transport
    }

    pub fn timers(&self) -> &TimerTools {
        &self.timers
    }

    pub fn advertise_url(&self) -> String {
        self.transport.advertise_url()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.transport.server_addr()
    }

    /// Our address for a given actor name.
    pub fn aid(&self, name: &str) -> Aid {
        Aid::new(name, self.advertise_url())
    }

    /// Tears everything down: tickers, then transport (send loop before
    /// receive loop), then timers. Idempotent.
    pub async fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            info!("litebus already finalized");
            return;
        }
        info!("litebus finalizing");
        self.sysmgr.finish();
        self.transport.finish().await;
        self.timers.finalize();
        info!("litebus finalized");
    }
}
