//! [`Spectrum`]: the process-wide lifecycle object.
//!
//! Owns the store, blob cache, chain state, indexer, wallet service, and
//! (when live) the Electrum transport. Built once by the embedding
//! process and passed explicitly to the dispatcher; there are no ambient
//! singletons.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use spectrum_common::shutdown::ShutdownChannel;
use spectrum_electrum::{
    ElectrumApi, ElectrumConfig, ElectrumSocket,
};
use spectrum_index::{ChainState, Indexer, NotificationRouter};
use spectrum_store::{Db, TxCache};
use spectrum_wallet::WalletService;
use tokio::sync::mpsc;
use tracing::info;

/// How long to wait for the first successful connect before starting in
/// offline mode (the supervisor keeps retrying in the background).
const STARTUP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SpectrumConfig {
    pub datadir: PathBuf,
    pub electrum: ElectrumConfig,
}

pub struct Spectrum {
    pub(crate) db: Arc<Db>,
    pub(crate) txcache: Arc<TxCache>,
    pub(crate) electrum: Arc<dyn ElectrumApi>,
    /// The live transport; absent when embedded over a scripted server.
    pub(crate) socket: Option<ElectrumSocket>,
    pub(crate) chain: Arc<ChainState>,
    pub(crate) indexer: Arc<Indexer>,
    pub(crate) wallets: WalletService,
    shutdown: ShutdownChannel,
}

impl Spectrum {
    /// Connect to the configured Electrum server and bring the gateway
    /// up: subscribe to headers, detect the chain from block 0, wire the
    /// notification router, and start the initial full sync.
    pub async fn start(config: SpectrumConfig) -> anyhow::Result<Arc<Self>> {
        info!(
            "Starting spectrum against {}:{} (tls={})",
            config.electrum.host, config.electrum.port,
            config.electrum.use_tls,
        );
        let socket = ElectrumSocket::start(config.electrum);
        let electrum: Arc<dyn ElectrumApi> = Arc::new(socket.clone());
        let node = Self::assemble(
            &config.datadir,
            electrum,
            Some(socket.clone()),
        )?;

        socket
            .wait_until_ok(STARTUP_CONNECT_TIMEOUT)
            .await
            .context("electrum server unreachable")?;
        node.discover_chain().await?;

        // The reconnect callback is wired only now, after the initial
        // connect, so it cannot re-enter the indexer before everything
        // above exists.
        let indexer = node.indexer.clone();
        socket.set_reconnect_callback(Arc::new(move || {
            indexer.spawn_full_sync();
        }));
        node.indexer.spawn_full_sync();
        Ok(node)
    }

    /// Wire everything except the live socket. Shared by [`start`] and
    /// the scripted-server tests.
    ///
    /// [`start`]: Self::start
    pub(crate) fn assemble(
        datadir: &std::path::Path,
        electrum: Arc<dyn ElectrumApi>,
        socket: Option<ElectrumSocket>,
    ) -> anyhow::Result<Arc<Self>> {
        let db = Arc::new(Db::open(datadir)?);
        let txcache = Arc::new(TxCache::open(datadir)?);
        let chain = Arc::new(ChainState::new());
        let indexer = Arc::new(Indexer::new(
            db.clone(),
            txcache.clone(),
            electrum.clone(),
            chain.clone(),
        ));
        let wallets = WalletService::new(
            db.clone(),
            txcache.clone(),
            electrum.clone(),
            chain.clone(),
            indexer.clone(),
        );
        let shutdown = ShutdownChannel::new();

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let router = Arc::new(NotificationRouter::new(
            chain.clone(),
            db.clone(),
            job_tx,
        ));
        if let Some(socket) = &socket {
            socket.set_notification_callback(router.into_callback());
        }
        indexer.spawn_worker(job_rx, shutdown.clone()).detach();
        db.spawn_persister(shutdown.clone()).detach();

        Ok(Arc::new(Self {
            db,
            txcache,
            electrum,
            socket,
            chain,
            indexer,
            wallets,
            shutdown,
        }))
    }

    /// Subscribe to headers and identify the chain from block 0's hash.
    pub(crate) async fn discover_chain(&self) -> anyhow::Result<()> {
        let tip = self.electrum.headers_subscribe().await?;
        let height = u32::try_from(tip.height)
            .context("implausible tip height")?;
        self.chain.apply_tip(height, &tip.hex)?;
        let root_header = self.electrum.block_header(0).await?;
        self.chain.set_root(&root_header)?;
        info!(
            "Tip at height {height}, chain {}",
            self.chain.chain(),
        );
        Ok(())
    }

    /// Whether the transport currently has a healthy connection.
    pub fn is_connected(&self) -> bool {
        self.socket
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(true)
    }

    /// Stop the transport and background tasks; the store persister
    /// writes one final snapshot on its way out.
    pub fn stop(&self) {
        info!("Stopping spectrum");
        self.shutdown.send();
        if let Some(socket) = &self.socket {
            socket.stop();
        }
    }
}
