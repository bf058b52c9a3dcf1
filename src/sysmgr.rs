//! System tickers
//!
//! Two background periodics over the transport: the send-metrics report,
//! and the idle recycler for HTTP-classified remote links when a recycle
//! period is configured.

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::LINK_RECYCLE_TICK;
use crate::net::TransportManager;

pub struct SysMgr {
    tickers: Mutex<Vec<JoinHandle<()>>>,
}

impl SysMgr {
    pub fn spawn(transport: TransportManager) -> Self {
        let mut tickers = Vec::new();
        let metrics_interval = transport.metrics_interval();
        let recycle_period = transport.link_recycle_period();

        let metrics_transport = transport.clone();
        tickers.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(metrics_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // the first tick completes immediately
            loop {
                tick.tick().await;
                match metrics_transport.collect_metrics().await {
                    Ok(report) if !report.is_empty() => report.log(),
                    Ok(_) => debug!("no send metrics to report"),
                    Err(_) => return,
                }
            }
        }));

        if let Some(period) = recycle_period {
            info!(period, "link recycling enabled");
            tickers.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(LINK_RECYCLE_TICK);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if transport.link_recycle_check(period).is_err() {
                        return;
                    }
                }
            }));
        }

        Self {
            tickers: Mutex::new(tickers),
        }
    }

    /// Stops the tickers. Idempotent.
    pub fn finish(&self) {
        for ticker in self.tickers.lock().drain(..) {
            ticker.abort();
        }
    }
}

impl Drop for SysMgr {
    fn drop(&mut self) {
        self.finish();
    }
}
