//! [`ElectrumSocket`]: the multiplexed, self-healing Electrum connection.
//!
//! Four workers cooperate over shared queues:
//!
//! | Worker   | Role |
//! |----------|------|
//! | writer   | drains the outgoing queue and writes `json\n` frames |
//! | reader   | splits input on `\n`, routes ids to waiters and methods to the notification queue |
//! | pinger   | issues `server.ping` on an interval; consecutive failures kill the socket |
//! | notifier | drains the notification queue into the registered callback |
//!
//! A fifth task, the supervisor, owns the lifecycle: it creates the socket,
//! spawns a generation of workers, and whenever any worker exits it stops
//! the rest, tears the socket down, and starts over. The application's
//! reconnect callback runs after the status returns to [`Status::Ok`], so
//! the callback may itself issue calls.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{stream::FuturesUnordered, StreamExt};
use rand_core::RngCore;
use serde_json::Value;
use spectrum_common::{
    rng::SysRng, shutdown::ShutdownChannel, task::SpTask,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::{oneshot, watch},
    time::{sleep, timeout},
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::{ElectrumConfig, SLEEP_RECV_LOOP, SLEEP_WRITE_LOOP},
    conn::{self, Stream},
    protocol::{self, Message, Notification, ServerError},
};

/// Callback invoked (on the notifier worker) for every server notification.
/// Must not block; offload real work to a queue.
pub type NotificationCallback = Arc<dyn Fn(Notification) + Send + Sync>;
/// Callback invoked after a successful reconnect, once calls work again.
pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Errors surfaced by [`ElectrumSocket::call`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// Deadline exceeded waiting for a call result (including socket loss
    /// while the call was in flight; the caller decides whether to retry).
    #[error("electrum call timed out")]
    Timeout,
    /// The transport is stopping.
    #[error("electrum transport is shutting down")]
    Shutdown,
    /// The server answered with an `error` object.
    #[error("electrum server error ({code}): {message}")]
    ServerError { code: i64, message: String },
    /// Malformed JSON or framing from the server.
    #[error("malformed data from electrum server: {0}")]
    Protocol(String),
}

impl From<ServerError> for TransportError {
    fn from(e: ServerError) -> Self {
        Self::ServerError {
            code: e.code,
            message: e.message,
        }
    }
}

/// Supervisor states. Transitions are a pure function of
/// `(state, worker liveness, socket creation outcome)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    CreatingSocket,
    BrokenCreatingSocket,
    CreatingThreads,
    ExecReconnectCb,
    Ok,
    BrokenKillingThreads,
    Shutdown,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatingSocket => "creating_socket",
            Self::BrokenCreatingSocket => "broken_creating_socket",
            Self::CreatingThreads => "creating_threads",
            Self::ExecReconnectCb => "exec_reconnect_cb",
            Self::Ok => "ok",
            Self::BrokenKillingThreads => "broken_killing_threads",
            Self::Shutdown => "shutdown",
        }
    }
}

/// State shared between the public handle, the supervisor, and the workers.
struct Shared {
    config: ElectrumConfig,
    /// Encoded request lines awaiting the writer.
    outgoing: Mutex<VecDeque<String>>,
    /// In-flight calls: request id -> waiter.
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Value, ServerError>>>>,
    /// Parsed notifications awaiting the notifier.
    notifications: Mutex<VecDeque<Notification>>,
    status_tx: watch::Sender<Status>,
    /// Whole-transport shutdown; observed by the supervisor and workers.
    shutdown: ShutdownChannel,
    notification_cb: Mutex<Option<NotificationCallback>>,
    reconnect_cb: Mutex<Option<ReconnectCallback>>,
    rng: Mutex<SysRng>,
}

impl Shared {
    fn set_status(&self, status: Status) {
        debug!("elsock status -> {}", status.as_str());
        self.status_tx.send_replace(status);
    }

    /// Fail every in-flight call. Dropping the waiters makes each caller
    /// observe `Timeout`.
    fn fail_pending(&self) {
        let n = {
            let mut pending = self.pending.lock().expect("poisoned");
            let n = pending.len();
            pending.clear();
            n
        };
        if n > 0 {
            debug!("Dropped {n} in-flight calls");
        }
    }
}

/// The public handle. Cheap to clone.
#[derive(Clone)]
pub struct ElectrumSocket {
    shared: Arc<Shared>,
}

impl ElectrumSocket {
    /// Create the transport and start its supervisor. Returns immediately;
    /// use [`wait_until_ok`](Self::wait_until_ok) to await connectivity.
    pub fn start(config: ElectrumConfig) -> Self {
        let (status_tx, _status_rx) = watch::channel(Status::CreatingSocket);
        let shared = Arc::new(Shared {
            config,
            outgoing: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            notifications: Mutex::new(VecDeque::new()),
            status_tx,
            shutdown: ShutdownChannel::new(),
            notification_cb: Mutex::new(None),
            reconnect_cb: Mutex::new(None),
            rng: Mutex::new(SysRng::new()),
        });

        SpTask::spawn("elsock-supervisor", supervisor(shared.clone()))
            .detach();

        Self { shared }
    }

    /// The supervisor's current state.
    pub fn status(&self) -> Status {
        *self.shared.status_tx.borrow()
    }

    /// Subscribe to supervisor state transitions.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Ok
    }

    /// Wait until the transport reaches [`Status::Ok`], up to `deadline`.
    pub async fn wait_until_ok(
        &self,
        deadline: Duration,
    ) -> Result<(), TransportError> {
        let mut rx = self.watch_status();
        let fut = async {
            loop {
                if *rx.borrow_and_update() == Status::Ok {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::Shutdown);
                }
            }
        };
        timeout(deadline, fut)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Register the notification callback. Runs on the notifier worker;
    /// must not block.
    pub fn set_notification_callback(&self, cb: NotificationCallback) {
        *self.shared.notification_cb.lock().expect("poisoned") = Some(cb);
    }

    /// Register the reconnect callback. Deliberately set *after* the
    /// initial connect so the first connection doesn't re-enter the caller
    /// before it is wired up.
    pub fn set_reconnect_callback(&self, cb: ReconnectCallback) {
        *self.shared.reconnect_cb.lock().expect("poisoned") = Some(cb);
    }

    /// Issue a JSON-RPC call and wait for its result with the configured
    /// call deadline. Not retried on socket loss; the caller decides.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        call_inner(&self.shared, method, params).await
    }

    /// Stop the transport. Workers observe the flag and exit; outstanding
    /// callers fail.
    pub fn stop(&self) {
        info!("Stopping electrum transport");
        self.shared.shutdown.send();
        self.shared.fail_pending();
    }
}

async fn call_inner(
    shared: &Shared,
    method: &str,
    params: Value,
) -> Result<Value, TransportError> {
    if shared.shutdown.try_recv() {
        return Err(TransportError::Shutdown);
    }

    let (tx, rx) = oneshot::channel();
    let id = {
        let mut rng = shared.rng.lock().expect("poisoned");
        let mut pending = shared.pending.lock().expect("poisoned");
        // Ids are random 32-bit values; loop on the (unlikely) collision.
        let id = loop {
            let id = rng.next_u32();
            if !pending.contains_key(&id) {
                break id;
            }
        };
        pending.insert(id, tx);
        id
    };

    let line = protocol::encode_request(method, &params, id)?;
    trace!("-> {method} (id {id})");
    shared.outgoing.lock().expect("poisoned").push_back(line);

    match timeout(shared.config.call_timeout(), rx).await {
        // Deadline exceeded; un-register the waiter.
        Err(_elapsed) => {
            shared.pending.lock().expect("poisoned").remove(&id);
            Err(TransportError::Timeout)
        }
        // The waiter was dropped: socket died (or transport stopped)
        // while the call was in flight.
        Ok(Err(_recv)) =>
            if shared.shutdown.try_recv() {
                Err(TransportError::Shutdown)
            } else {
                Err(TransportError::Timeout)
            },
        Ok(Ok(Ok(result))) => Ok(result),
        Ok(Ok(Err(server_err))) => Err(server_err.into()),
    }
}

// --- Supervisor --- //

async fn supervisor(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.try_recv() {
            break;
        }

        // creating_socket
        shared.set_status(Status::CreatingSocket);
        let stream = match conn::connect(&shared.config).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Failed to connect to {}:{}: {e:#}",
                    shared.config.host, shared.config.port
                );
                shared.set_status(Status::BrokenCreatingSocket);
                tokio::select! {
                    () = sleep(shared.config.reconnect_delay) => continue,
                    () = shared.shutdown.recv() => continue,
                }
            }
        };

        // creating_threads
        shared.set_status(Status::CreatingThreads);
        let generation = ShutdownChannel::new();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut workers = FuturesUnordered::new();
        workers.push(SpTask::spawn(
            "elsock-writer",
            writer_loop(shared.clone(), generation.clone(), write_half),
        ));
        workers.push(SpTask::spawn(
            "elsock-reader",
            reader_loop(shared.clone(), generation.clone(), read_half),
        ));
        workers.push(SpTask::spawn(
            "elsock-pinger",
            pinger_loop(shared.clone(), generation.clone()),
        ));
        workers.push(SpTask::spawn(
            "elsock-notifier",
            notifier_loop(shared.clone(), generation.clone()),
        ));

        // exec_reconnect_cb: flip to ok *before* running the callback so
        // the callback can issue calls.
        shared.set_status(Status::ExecReconnectCb);
        let reconnect_cb =
            shared.reconnect_cb.lock().expect("poisoned").clone();
        shared.set_status(Status::Ok);
        if let Some(cb) = reconnect_cb {
            cb();
        }

        // ok: idle until any worker dies or we are told to stop.
        tokio::select! {
            _ = workers.next() => debug!("A transport worker exited"),
            () = shared.shutdown.recv() => (),
        }

        // broken_killing_threads: stop the generation, join the rest with
        // an exponentially growing log cadence.
        shared.set_status(Status::BrokenKillingThreads);
        generation.send();
        let mut wait = Duration::from_secs(1);
        while !workers.is_empty() {
            tokio::select! {
                _ = workers.next() => (),
                () = sleep(wait) => {
                    let names: Vec<&str> =
                        workers.iter().map(|w| w.name()).collect();
                    info!("Still waiting on workers: {names:?}");
                    wait *= 2;
                }
            }
        }
        shared.fail_pending();
    }

    shared.set_status(Status::Shutdown);
    shared.fail_pending();
    info!("Electrum transport stopped");
}

// --- Workers --- //

/// Drains the outgoing queue into the socket.
async fn writer_loop(
    shared: Arc<Shared>,
    generation: ShutdownChannel,
    mut write_half: WriteHalf<Stream>,
) {
    loop {
        if generation.try_recv() || shared.shutdown.try_recv() {
            break;
        }
        let line = shared.outgoing.lock().expect("poisoned").pop_front();
        match line {
            Some(line) => {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    warn!("Socket write failed: {e:#}");
                    break;
                }
                if let Err(e) = write_half.flush().await {
                    warn!("Socket flush failed: {e:#}");
                    break;
                }
            }
            None => sleep(SLEEP_WRITE_LOOP).await,
        }
    }
    debug!("Writer exiting");
}

/// Reads `\n`-delimited frames, routing responses to their waiters and
/// notifications to the notifier's queue.
async fn reader_loop(
    shared: Arc<Shared>,
    generation: ShutdownChannel,
    read_half: ReadHalf<Stream>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        if generation.try_recv() || shared.shutdown.try_recv() {
            break;
        }
        line.clear();
        match timeout(shared.config.socket_timeout, reader.read_line(&mut line))
            .await
        {
            // recv timeout: a no-op, go around and check the flags.
            Err(_elapsed) => continue,
            Ok(Ok(0)) => {
                debug!("Socket EOF");
                break;
            }
            Ok(Ok(_n)) => route_frame(&shared, &line),
            Ok(Err(e)) => {
                warn!("Socket read failed: {e:#}");
                break;
            }
        }
    }
    debug!("Reader exiting");
}

fn route_frame(shared: &Shared, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    match protocol::parse_line(trimmed) {
        Ok(Message::Response { id, result }) => {
            let waiter =
                shared.pending.lock().expect("poisoned").remove(&id);
            match waiter {
                // An Err here means the caller timed out and went away.
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => debug!("Response for unknown call id {id}"),
            }
        }
        Ok(Message::Notification(notification)) => {
            trace!("<- notification {}", notification.method);
            shared
                .notifications
                .lock()
                .expect("poisoned")
                .push_back(notification);
        }
        // Malformed server data never panics; the affected caller (if
        // any) times out.
        Err(e) => warn!("Dropping malformed frame: {e:#}"),
    }
}

/// Issues `server.ping` on an interval. Exits (tripping the supervisor)
/// after `tries_threshold` consecutive failures.
async fn pinger_loop(shared: Arc<Shared>, generation: ShutdownChannel) {
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            () = sleep(shared.config.ping_interval) => (),
            () = generation.recv() => break,
            () = shared.shutdown.recv() => break,
        }
        match call_inner(&shared, "server.ping", Value::Array(vec![])).await {
            Ok(_) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(
                    "Ping failed ({failures}/{}): {e:#}",
                    shared.config.tries_threshold
                );
                if failures >= shared.config.tries_threshold {
                    break;
                }
            }
        }
    }
    debug!("Pinger exiting");
}

/// Drains the notification queue into the registered callback. Runs apart
/// from the reader so a slow callback cannot stall frame routing. Until a
/// callback is registered, notifications stay queued.
async fn notifier_loop(shared: Arc<Shared>, generation: ShutdownChannel) {
    loop {
        if generation.try_recv() || shared.shutdown.try_recv() {
            break;
        }
        let cb = shared.notification_cb.lock().expect("poisoned").clone();
        let Some(cb) = cb else {
            sleep(SLEEP_RECV_LOOP).await;
            continue;
        };
        let notification =
            shared.notifications.lock().expect("poisoned").pop_front();
        match notification {
            Some(notification) => cb(notification),
            None => sleep(SLEEP_RECV_LOOP).await,
        }
    }
    debug!("Notifier exiting");
}
