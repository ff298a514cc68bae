//! The cluster manager runtime.
//!
//! Two long-running tasks service worker arrivals: the *acceptor*
//! pushes inbound sockets onto a bounded queue (blocking when a burst
//! of handshakes outruns registration — natural backpressure), and the
//! *registrar* drains the queue, authenticates each socket, and hands
//! it to the distributed runtime. Alongside, the manager keeps the
//! per-scale-set worker reference count and drives the kill protocol
//! for departing workers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use azgrid_azure::{AzureClient, Session};
use azgrid_core::{ScaleSetKey, Template, WorkerUserdata};
use azgrid_scaleset::reconciler::{
    create_or_update, delete_instances, delete_scaleset, get_instance, is_vm_in_scaleset,
};
use azgrid_scaleset::{cloudinit, ImageSpec, ScriptParams, SshKeys};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ManagerResult;
use crate::handshake::read_handshake;
use crate::runtime::{DistributedRuntime, WorkerConfig};

/// Capacity of the accepted-but-unregistered socket queue.
const PENDING_UP_CAPACITY: usize = 32;

/// First port tried for the worker listener.
const LISTEN_PORT_START: u16 = 9000;

/// Seconds between kill-verification polls, plus up to 10 s of jitter.
const KILL_POLL_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Shared secret workers present on their handshake.
    pub cookie: String,
    pub nretry: u32,
    pub verbose: bool,
    /// Management endpoint override (tests point this at a mock).
    pub endpoint: Option<String>,
    /// Range of the random pre-kill sleep that smooths API rate limits.
    pub kill_smoothing_secs: (u64, u64),
    pub listen_port_start: u16,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            cookie: String::new(),
            nretry: 10,
            verbose: false,
            endpoint: None,
            kill_smoothing_secs: (1, 11),
            listen_port_start: LISTEN_PORT_START,
        }
    }
}

/// Master-side cluster state. One instance per master process; the
/// embedding runtime usually goes through [`ClusterManager::init`] for
/// the shared one.
pub struct ClusterManager {
    cookie: String,
    listen_addr: SocketAddr,
    runtime: Arc<dyn DistributedRuntime>,
    client: RwLock<AzureClient>,
    endpoint: Option<String>,
    scaleset_count: Mutex<HashMap<ScaleSetKey, u64>>,
    pending_down: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    kill_smoothing_secs: (u64, u64),
}

static GLOBAL: OnceCell<Arc<ClusterManager>> = OnceCell::const_new();

impl ClusterManager {
    /// The process-wide manager. The first call binds the listener and
    /// starts the acceptor/registrar tasks; subsequent calls only
    /// refresh the session, retry budget, and verbosity.
    pub async fn init(
        runtime: Arc<dyn DistributedRuntime>,
        session: Session,
        options: ManagerOptions,
    ) -> ManagerResult<Arc<Self>> {
        let manager = GLOBAL
            .get_or_try_init(|| Self::start(runtime, session.clone(), options.clone()))
            .await?;
        manager.refresh(session, options.nretry, options.verbose);
        Ok(Arc::clone(manager))
    }

    /// Start a standalone manager instance: bind the first free port at
    /// or above the configured start, spawn the acceptor and registrar.
    pub async fn start(
        runtime: Arc<dyn DistributedRuntime>,
        session: Session,
        options: ManagerOptions,
    ) -> ManagerResult<Arc<Self>> {
        let listener = bind_from(options.listen_port_start).await?;
        let listen_addr = listener.local_addr()?;

        let mut client = AzureClient::new(session)
            .with_nretry(options.nretry)
            .with_verbose(options.verbose);
        if let Some(endpoint) = &options.endpoint {
            client = client.with_endpoint(endpoint.clone());
        }

        let manager = Arc::new(Self {
            cookie: options.cookie,
            listen_addr,
            runtime,
            client: RwLock::new(client),
            endpoint: options.endpoint,
            scaleset_count: Mutex::new(HashMap::new()),
            pending_down: tokio::sync::Mutex::new(Vec::new()),
            kill_smoothing_secs: options.kill_smoothing_secs,
        });

        let (pending_up_tx, pending_up_rx) = mpsc::channel(PENDING_UP_CAPACITY);
        tokio::spawn(acceptor(listener, pending_up_tx));
        tokio::spawn(Arc::clone(&manager).registrar(pending_up_rx));

        info!(addr = %listen_addr, "cluster manager listening for workers");
        Ok(manager)
    }

    /// Replace the session and request settings without touching the
    /// listener or queues.
    pub fn refresh(&self, session: Session, nretry: u32, verbose: bool) {
        let mut new_client = AzureClient::new(session)
            .with_nretry(nretry)
            .with_verbose(verbose);
        if let Some(endpoint) = &self.endpoint {
            new_client = new_client.with_endpoint(endpoint.clone());
        }
        *self.client.write().expect("client lock poisoned") = new_client;
    }

    /// The address workers dial back to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    fn client(&self) -> AzureClient {
        self.client.read().expect("client lock poisoned").clone()
    }

    // ── Provisioning ───────────────────────────────────────────────

    /// Grow (or create) a scale set by `ninstances` and account for the
    /// workers that will dial in. The counter tracks one primary worker
    /// per instance — the one carrying placement metadata, which is
    /// also the one whose deregistration decrements. Returns the scale
    /// set's new capacity.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_workers(
        &self,
        key: &ScaleSetKey,
        template: &Template,
        image: &ImageSpec,
        ninstances: u64,
        params: &mut ScriptParams,
        ssh: &SshKeys,
        spot: bool,
        max_price: f64,
        interrupt: &mut watch::Receiver<bool>,
    ) -> ManagerResult<u64> {
        params.cookie = self.cookie.clone();
        params.master_port = self.listen_addr.port();

        let script = cloudinit::build_worker_script(params);
        let custom_data = cloudinit::encode(&script);

        let client = self.client();
        let capacity = create_or_update(
            &client, key, ninstances, template, image, &custom_data, ssh, spot, max_price,
            interrupt,
        )
        .await?;

        self.add_capacity(key, ninstances);
        Ok(capacity)
    }

    // ── Reference counting ─────────────────────────────────────────

    /// Record `delta` additional workers attributed to a scale set.
    pub fn add_capacity(&self, key: &ScaleSetKey, delta: u64) {
        let mut counts = self.scaleset_count.lock().expect("count lock poisoned");
        *counts.entry(key.clone()).or_insert(0) += delta;
    }

    /// Snapshot of the per-scale-set worker counts.
    pub fn worker_counts(&self) -> HashMap<ScaleSetKey, u64> {
        self.scaleset_count
            .lock()
            .expect("count lock poisoned")
            .clone()
    }

    fn count_for(&self, key: &ScaleSetKey) -> u64 {
        self.scaleset_count
            .lock()
            .expect("count lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// A worker deregistered (or was interrupted). A primary worker
    /// (placement metadata present) decrements its scale set's count;
    /// the last departure deletes the whole scale set. Secondary
    /// processes sharing a VM never touch the counter.
    pub async fn deregister(&self, config: &WorkerConfig) {
        let Some(userdata) = &config.userdata else {
            return;
        };
        let key = userdata.scaleset_key();
        let delete = {
            let mut counts = self.scaleset_count.lock().expect("count lock poisoned");
            decrement_count(&mut counts, &key)
        };
        if delete {
            info!(scaleset = %key, "last worker deregistered, deleting scale set");
            if let Err(e) = delete_scaleset(&self.client(), &key).await {
                warn!(scaleset = %key, error = %e, "scale set delete failed, check the Azure portal");
            }
        }
    }

    // ── Kill protocol ──────────────────────────────────────────────

    /// Remove one worker: exit RPC now, instance deletion in the
    /// background. The background task is tracked so [`shutdown`]
    /// drains it before process exit.
    ///
    /// [`shutdown`]: ClusterManager::shutdown
    pub async fn kill(self: &Arc<Self>, config: WorkerConfig) {
        self.runtime.send_exit(&config);

        // Secondary processes share a VM with a primary; only the
        // primary carries placement metadata and owns the instance.
        let Some(userdata) = config.userdata else {
            return;
        };

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.remove_instance(userdata).await;
        });
        self.pending_down.lock().await.push(handle);
    }

    async fn remove_instance(&self, userdata: WorkerUserdata) {
        // Spread simultaneous kills out to stay under Azure rate limits.
        let (lo, hi) = self.kill_smoothing_secs;
        let smoothing = { rand::rng().random_range(lo..=hi) };
        tokio::time::sleep(Duration::from_secs(smoothing)).await;

        let key = userdata.scaleset_key();
        if self.count_for(&key) == 0 {
            debug!(scaleset = %key, "scale set already being torn down");
            return;
        }

        let client = self.client();
        match is_vm_in_scaleset(&client, &userdata).await {
            Ok(true) => {}
            Ok(false) => {
                info!(worker = %userdata.name, "vm no longer in scale set, marked terminated locally");
                return;
            }
            Err(e) => {
                warn!(worker = %userdata.name, error = %e, "could not verify vm membership, check the Azure portal");
                return;
            }
        }

        if let Err(e) =
            delete_instances(&client, &key, std::slice::from_ref(&userdata.instanceid)).await
        {
            warn!(worker = %userdata.name, error = %e, "instance delete failed, check the Azure portal");
            return;
        }

        self.verify_deletion(&client, &key, &userdata).await;
    }

    /// Poll the instance until Azure returns 404. `Deleting` (and the
    /// not-yet-transitioned `Succeeded`) keep the poll alive; any other
    /// state means something needs eyes on the portal. The poll is
    /// bounded by the runtime's worker timeout — overrunning it warns
    /// and returns so shutdown never hangs on a stuck deletion.
    async fn verify_deletion(
        &self,
        client: &AzureClient,
        key: &ScaleSetKey,
        userdata: &WorkerUserdata,
    ) {
        let timeout = self.runtime.worker_timeout();
        let started = tokio::time::Instant::now();
        loop {
            match get_instance(client, key, &userdata.instanceid).await {
                Err(e) if e.is_not_found() => {
                    debug!(worker = %userdata.name, "instance deletion confirmed");
                    return;
                }
                Err(e) => {
                    warn!(worker = %userdata.name, error = %e, "instance deletion unverified, check the Azure portal");
                    return;
                }
                Ok(vm) => match vm["properties"]["provisioningState"].as_str() {
                    Some("Succeeded") | Some("Deleting") | None => {}
                    Some(state) => {
                        warn!(worker = %userdata.name, state, "unexpected state while deleting, check the Azure portal");
                        return;
                    }
                },
            }
            if started.elapsed() > timeout {
                warn!(
                    worker = %userdata.name,
                    timeout_secs = timeout.as_secs(),
                    "instance still present after worker timeout, check the Azure portal"
                );
                return;
            }
            let jitter = { rand::rng().random_range(0..=10) };
            tokio::time::sleep(Duration::from_secs(KILL_POLL_INTERVAL_SECS + jitter)).await;
        }
    }

    /// Await every in-flight worker removal. Call before process exit;
    /// the master must not terminate while kill tasks are outstanding.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.pending_down.lock().await.drain(..).collect();
        let outstanding = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        if outstanding > 0 {
            info!(outstanding, "pending worker removals drained");
        }
    }
}

/// Accept worker sockets forever, pushing each into the bounded queue.
async fn acceptor(listener: TcpListener, pending_up: mpsc::Sender<TcpStream>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "worker connection accepted");
                if pending_up.send(stream).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

impl ClusterManager {
    /// Drain the queue: authenticate each socket and register it with
    /// the runtime, in accept order. Handshake failures close the
    /// socket and register nothing.
    async fn registrar(self: Arc<Self>, mut pending_up: mpsc::Receiver<TcpStream>) {
        while let Some(mut stream) = pending_up.recv().await {
            match read_handshake(&mut stream, &self.cookie).await {
                Ok(greeting) => {
                    let config = WorkerConfig {
                        bind_addr: greeting.bind_addr,
                        count: greeting.ppi,
                        exename: "julia".to_string(),
                        exeflags: "--worker".to_string(),
                        userdata: greeting.userdata,
                    };
                    info!(bind_addr = %config.bind_addr, ppi = config.count, "worker registered");
                    self.runtime.register(stream, config);
                }
                Err(e) => {
                    warn!(error = %e, "worker handshake failed, closing connection");
                }
            }
        }
    }
}

async fn bind_from(start_port: u16) -> std::io::Result<TcpListener> {
    let mut port = start_port;
    loop {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && port < start_port + 1000 => {
                port += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decrement a scale set's count. True when the count reached zero and
/// the scale set should be deleted. An unknown key is a no-op.
fn decrement_count(counts: &mut HashMap<ScaleSetKey, u64>, key: &ScaleSetKey) -> bool {
    match counts.get_mut(key) {
        Some(count) => {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(key);
                true
            } else {
                false
            }
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::padded_cookie;
    use azgrid_azure::StaticToken;
    use azgrid_core::WorkerGreeting;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Runtime fake that records registrations in arrival order.
    struct RecordingRuntime {
        registered: Mutex<Vec<WorkerConfig>>,
    }

    impl RecordingRuntime {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                registered: Mutex::new(Vec::new()),
            })
        }
    }

    impl DistributedRuntime for RecordingRuntime {
        fn register(&self, _stream: TcpStream, config: WorkerConfig) {
            self.registered.lock().unwrap().push(config);
        }

        fn send_exit(&self, _config: &WorkerConfig) {}

        fn worker_timeout(&self) -> Duration {
            Duration::from_secs(60)
        }
    }

    async fn test_manager(runtime: Arc<RecordingRuntime>) -> Arc<ClusterManager> {
        let options = ManagerOptions {
            cookie: "secret".to_string(),
            kill_smoothing_secs: (0, 1),
            ..Default::default()
        };
        ClusterManager::start(runtime, Arc::new(StaticToken::new("t")), options)
            .await
            .unwrap()
    }

    async fn dial_worker(addr: SocketAddr, cookie: &str, bind_addr: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&padded_cookie(cookie)).await.unwrap();
        let greeting = WorkerGreeting {
            bind_addr: bind_addr.to_string(),
            ppi: 1,
            userdata: None,
        };
        let json = serde_json::to_vec(&greeting).unwrap();
        let mut line = STANDARD.encode(json).into_bytes();
        line.push(b'\n');
        stream.write_all(&line).await.unwrap();
        stream
    }

    async fn wait_for_registrations(runtime: &RecordingRuntime, n: usize) {
        for _ in 0..200 {
            if runtime.registered.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} registrations");
    }

    #[tokio::test]
    async fn workers_register_in_accept_order() {
        let runtime = RecordingRuntime::new();
        let manager = test_manager(Arc::clone(&runtime)).await;

        let _w1 = dial_worker(manager.listen_addr(), "secret", "10.0.0.1:9001").await;
        wait_for_registrations(&runtime, 1).await;
        let _w2 = dial_worker(manager.listen_addr(), "secret", "10.0.0.2:9001").await;
        wait_for_registrations(&runtime, 2).await;

        let registered = runtime.registered.lock().unwrap();
        assert_eq!(registered[0].bind_addr, "10.0.0.1:9001");
        assert_eq!(registered[1].bind_addr, "10.0.0.2:9001");
    }

    #[tokio::test]
    async fn bad_cookie_closes_socket_without_registering() {
        let runtime = RecordingRuntime::new();
        let manager = test_manager(Arc::clone(&runtime)).await;

        let mut bad = TcpStream::connect(manager.listen_addr()).await.unwrap();
        bad.write_all(&padded_cookie("intruder")).await.unwrap();
        bad.write_all(b"anything\n").await.unwrap();

        // The registrar drops the stream; the peer sees EOF.
        let mut buf = [0u8; 1];
        let n = bad.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(runtime.registered.lock().unwrap().is_empty());

        // A well-behaved worker still gets through afterwards.
        let _good = dial_worker(manager.listen_addr(), "secret", "10.0.0.3:9001").await;
        wait_for_registrations(&runtime, 1).await;
    }

    #[tokio::test]
    async fn listener_binds_at_or_above_9000() {
        let runtime = RecordingRuntime::new();
        let manager = test_manager(runtime).await;
        assert!(manager.listen_addr().port() >= 9000);
    }

    #[test]
    fn decrement_reaches_zero_exactly_once() {
        let key = ScaleSetKey::new("s", "rg", "grp");
        let mut counts = HashMap::from([(key.clone(), 2u64)]);
        assert!(!decrement_count(&mut counts, &key));
        assert!(decrement_count(&mut counts, &key));
        // Further decrements on a gone key are no-ops.
        assert!(!decrement_count(&mut counts, &key));
    }

    #[tokio::test]
    async fn capacity_accounting() {
        let runtime = RecordingRuntime::new();
        let manager = test_manager(runtime).await;
        let key = ScaleSetKey::new("s", "rg", "grp");

        manager.add_capacity(&key, 4);
        manager.add_capacity(&key, 2);
        assert_eq!(manager.worker_counts()[&key], 6);
    }

    #[tokio::test]
    async fn deregister_without_userdata_is_a_noop() {
        let runtime = RecordingRuntime::new();
        let manager = test_manager(runtime).await;
        let config = WorkerConfig {
            bind_addr: "10.0.0.1:9001".into(),
            count: 1,
            exename: "julia".into(),
            exeflags: "--worker".into(),
            userdata: None,
        };
        manager.deregister(&config).await;
        assert!(manager.worker_counts().is_empty());
    }
}
