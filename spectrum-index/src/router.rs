//! Routing of server notifications into the index.
//!
//! Runs under the transport's notifier worker, so nothing here may block:
//! header updates are a couple of lock writes, and script-hash updates are
//! turned into jobs on the indexer's work queue.

use std::sync::Arc;

use serde_json::Value;
use spectrum_electrum::{transport::NotificationCallback, Notification};
use spectrum_store::Db;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{chain::ChainState, indexer::ReconcileJob};

pub struct NotificationRouter {
    chain: Arc<ChainState>,
    db: Arc<Db>,
    job_tx: mpsc::UnboundedSender<ReconcileJob>,
}

impl NotificationRouter {
    pub fn new(
        chain: Arc<ChainState>,
        db: Arc<Db>,
        job_tx: mpsc::UnboundedSender<ReconcileJob>,
    ) -> Self {
        Self { chain, db, job_tx }
    }

    /// Adapt into the transport's callback shape.
    pub fn into_callback(self: Arc<Self>) -> NotificationCallback {
        Arc::new(move |notification| self.handle(notification))
    }

    pub fn handle(&self, notification: Notification) {
        match notification.method.as_str() {
            "blockchain.headers.subscribe" =>
                self.handle_new_header(&notification.params),
            "blockchain.scripthash.subscribe" =>
                self.handle_scripthash(&notification.params),
            other => debug!("Ignoring notification method {other}"),
        }
    }

    fn handle_new_header(&self, params: &Value) {
        let tip = &params[0];
        let (Some(height), Some(hex)) =
            (tip["height"].as_u64(), tip["hex"].as_str())
        else {
            warn!("Malformed headers notification: {params}");
            return;
        };
        let height = match u32::try_from(height) {
            Ok(height) => height,
            Err(_) => {
                warn!("Implausible tip height {height}");
                return;
            }
        };
        if let Err(e) = self.chain.apply_tip(height, hex) {
            warn!("Dropping bad tip header: {e:#}");
        } else {
            debug!("New tip at height {height}");
        }
    }

    fn handle_scripthash(&self, params: &Value) {
        let Some(scripthash) = params[0].as_str() else {
            warn!("Malformed scripthash notification: {params}");
            return;
        };
        let state = params[1].as_str().map(str::to_owned);
        // Several wallets can watch the same script.
        for script in self.db.scripts_by_scripthash(scripthash) {
            let job = ReconcileJob {
                script_id: script.id,
                state: state.clone(),
            };
            if self.job_tx.send(job).is_err() {
                warn!("Indexer work queue is gone; dropping update");
                return;
            }
        }
    }
}
