//! Server instance and its handle.
//!
//! [`ServerCore`] owns both schedulers, the connection registry and every
//! counter. [`ServerHandle`] holds at most one core behind a reader-writer
//! lock: request paths take the read side through [`ServerHandle::get`],
//! while start, exit and reset take the write side. The write lock is never
//! held across socket I/O or engine calls.
//!
//! ## Startup
//!
//! `start` launches the schedulers and posts the network task. On the
//! acceptor thread that task waits for the engine, checks the internal
//! account's grants, reads the engine's network settings, negotiates TLS,
//! binds the listeners and publishes their addresses. Only then is the
//! instance reported as running and the accept loop entered.
//!
//! ## Shutdown
//!
//! Either [`ServerHandle::exit`] or the acceptor's timer (on the exit flag or
//! engine termination) calls [`ServerCore::stop`]. The first caller cancels
//! the accept loop, signals every connection, stops both schedulers and
//! releases whatever is still registered.

use crate::admission::{AdmissionController, RejectReason};
use crate::auth::AuthenticationRegistry;
use crate::engine::{wait_until_ready, Engine};
use crate::grants::{verify_account_grants, INTERNAL_ACCOUNT};
use crate::network::bind::{bind_tcp, bind_unix};
use crate::network::client::run_connection;
use crate::network::listener::{Acceptor, Listeners};
use crate::network::{
    listen_backlog, BindAddress, ClientStream, Connection, ConnectionId, ConnectionRegistry,
    ConnectionState, PeerAddress,
};
use crate::properties::{PropertyId, ServerProperties};
use crate::protocol::ProtocolHandler;
use crate::shutdown::{ExitFlag, ShutdownCoordinator, ShutdownState};
use crate::status::GlobalStatus;
use crate::text_protocol::TextProtocol;
use crate::tls::TlsContext;
use parking_lot::{Condvar, MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::net::Shutdown;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xfront_core::config::{FrontendConfig, LiveConfig, LiveSettings, NetworkConfig, TlsSettings};
use xfront_core::ids::{DocumentIdGenerator, IdVariables};
use xfront_core::runtime::{
    NoopHooks, Scheduler, SchedulerMonitor, SchedulerOptions, WorkerLifecycle,
};
use xfront_core::{Error, Result};

/// Thread name of the session workers; the worker number is appended.
pub const SESSION_WORKER_NAME: &str = "xfront_worker";

/// Thread name of the acceptor.
pub const ACCEPTOR_NAME: &str = "xfront_acceptor";

/// How long a second `stop` caller waits for the first to finish.
const STOP_WAIT: Duration = Duration::from_secs(60);

/// Per-message limits read by the serving workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolLimits {
    pub interactive_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_allowed_packet: u32,
}

/// Progress of the network task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupState {
    Starting,
    Running,
    Failed(Error),
}

/// Runs engine per-thread setup on every worker.
struct EngineThreadHooks {
    engine: Arc<dyn Engine>,
}

impl WorkerLifecycle for EngineThreadHooks {
    fn thread_init(&self) -> bool {
        self.engine.init_thread()
    }

    fn thread_end(&self) {
        self.engine.deinit_thread();
    }
}

/// The live server instance.
pub struct ServerCore {
    network: NetworkConfig,
    tls_settings: TlsSettings,
    bind: BindAddress,
    backlog: u32,
    document_id_prefix: u16,

    engine: Arc<dyn Engine>,
    protocol: Arc<dyn ProtocolHandler>,
    live: Arc<LiveConfig>,
    exit: ExitFlag,

    session_scheduler: Scheduler,
    network_scheduler: Scheduler,
    registry: ConnectionRegistry,
    admission: AdmissionController,
    status: Arc<GlobalStatus>,
    coordinator: ShutdownCoordinator,
    auth: AuthenticationRegistry,
    properties: ServerProperties,
    document_generator: Arc<DocumentIdGenerator>,
    tls: RwLock<TlsContext>,
    cancel: CancellationToken,

    last_connection_id: AtomicU64,
    interactive_timeout_secs: AtomicU64,
    connect_timeout_secs: AtomicU64,
    max_allowed_packet: AtomicU32,

    startup: Mutex<StartupState>,
    startup_cv: Condvar,
}

impl ServerCore {
    fn new(
        config: FrontendConfig,
        engine: Arc<dyn Engine>,
        protocol: Arc<dyn ProtocolHandler>,
        live: Arc<LiveConfig>,
        exit: ExitFlag,
    ) -> Result<Arc<Self>> {
        let bind = BindAddress::parse(&config.network.bind_address)?;
        bind.check_bindable()?;

        let limits = live.snapshot();
        let backlog = listen_backlog(limits.max_connections, config.network.backlog_bound);
        let status = Arc::new(GlobalStatus::new());
        let hooks: Arc<dyn WorkerLifecycle> =
            Arc::new(EngineThreadHooks { engine: Arc::clone(&engine) });
        let monitor: Arc<dyn SchedulerMonitor> = status.clone();

        let session_scheduler = Scheduler::with_hooks(
            SchedulerOptions {
                name: SESSION_WORKER_NAME.to_string(),
                min_workers: limits.min_worker_threads,
                max_workers: config.workers.max_threads,
                idle_timeout: limits.idle_worker_timeout(),
                queue_capacity: config.workers.queue_capacity,
            },
            Arc::clone(&hooks),
            monitor,
        );
        let network_scheduler = Scheduler::with_hooks(
            SchedulerOptions::single(ACCEPTOR_NAME),
            hooks,
            Arc::new(NoopHooks),
        );

        Ok(Arc::new(Self {
            network: config.network,
            tls_settings: config.tls,
            bind,
            backlog,
            document_id_prefix: config.ids.document_id_unique_prefix,
            engine,
            protocol,
            live,
            exit,
            session_scheduler,
            network_scheduler,
            registry: ConnectionRegistry::new(),
            admission: AdmissionController::new(limits.max_connections, Arc::clone(&status)),
            status,
            coordinator: ShutdownCoordinator::new(),
            auth: AuthenticationRegistry::with_defaults(),
            properties: ServerProperties::new(),
            document_generator: Arc::new(DocumentIdGenerator::new()),
            tls: RwLock::new(TlsContext::disabled()),
            cancel: CancellationToken::new(),
            last_connection_id: AtomicU64::new(0),
            interactive_timeout_secs: AtomicU64::new(limits.interactive_timeout_secs),
            connect_timeout_secs: AtomicU64::new(limits.connect_timeout_secs),
            max_allowed_packet: AtomicU32::new(limits.max_allowed_packet),
            startup: Mutex::new(StartupState::Starting),
            startup_cv: Condvar::new(),
        }))
    }

    /// Start the schedulers, subscribe to live settings and post the network task.
    fn launch(self: &Arc<Self>) -> Result<()> {
        self.session_scheduler.launch();
        self.network_scheduler.launch();

        let weak = Arc::downgrade(self);
        self.live.subscribe(
            "workers",
            Arc::new(move |settings: &LiveSettings| {
                if let Some(core) = weak.upgrade() {
                    core.apply_worker_settings(settings);
                }
            }),
        );
        let weak = Arc::downgrade(self);
        self.live.subscribe(
            "timeouts",
            Arc::new(move |settings: &LiveSettings| {
                if let Some(core) = weak.upgrade() {
                    core.apply_timeouts(settings);
                }
            }),
        );
        self.on_config_changed(&self.live.snapshot());

        let core = Arc::clone(self);
        if !self.network_scheduler.post(move || core.net_thread()) {
            self.stop(false);
            return Err(Error::internal("network scheduler refused the acceptor task"));
        }
        Ok(())
    }

    fn net_thread(self: Arc<Self>) {
        match self.on_net_startup() {
            Ok(listeners) => {
                self.set_startup(StartupState::Running);
                info!(
                    version = xfront_core::VERSION,
                    tcp_port = %self.properties.get(PropertyId::TcpPort),
                    socket = %self.properties.get(PropertyId::UnixSocket),
                    "Front-end ready"
                );
                if let Err(e) = Acceptor::new(Arc::clone(&self), listeners).run() {
                    error!(error = %e, "Acceptor failed");
                }
            },
            Err(e) => {
                if self.exit.is_set() {
                    debug!(error = %e, "Startup abandoned, exit requested");
                } else {
                    error!(error = %e, "Startup failed");
                }
                self.registry.close_all();
                self.set_startup(StartupState::Failed(e));
            },
        }
    }

    fn on_net_startup(&self) -> Result<Listeners> {
        wait_until_ready(self.engine.as_ref(), self.network.engine_ready_timeout(), &self.exit)?;
        self.verify_grants()?;

        let settings = self
            .engine
            .network_settings()
            .map_err(|e| Error::ServiceNotReady { message: e.to_string() })?;
        if settings.skip_name_resolve {
            debug!("Peers identified by address only");
        }

        *self.tls.write() = TlsContext::establish(&self.tls_settings, &settings);

        let mut listeners = Listeners::default();
        if settings.skip_networking {
            info!("skip_networking set, TCP listeners disabled");
        } else {
            let retry = self.network.port_open_timeout();
            listeners.tcp =
                Some(bind_tcp(&self.bind, self.network.port, self.backlog, retry, &self.exit)?);
            listeners.secondary = self
                .network
                .secondary_port
                .map(|port| bind_tcp(&self.bind, port, self.backlog, retry, &self.exit))
                .transpose()?;
        }
        if let Some(path) = &self.network.socket {
            listeners.unix = Some((bind_unix(path, self.backlog)?, path.clone()));
        }
        if listeners.is_empty() {
            return Err(Error::configuration("no listener configured"));
        }

        self.properties.publish([
            (PropertyId::TcpPort, listeners.tcp_port().map(|p| p.to_string())),
            (PropertyId::TcpBindAddress, listeners.tcp.as_ref().map(|_| self.bind.host.clone())),
            (PropertyId::SecondaryPort, listeners.secondary_port().map(|p| p.to_string())),
            (
                PropertyId::UnixSocket,
                listeners.unix.as_ref().map(|(_, path)| path.display().to_string()),
            ),
        ]);
        Ok(listeners)
    }

    fn verify_grants(&self) -> Result<()> {
        let grants = self
            .engine
            .show_grants(INTERNAL_ACCOUNT)
            .map_err(|e| Error::internal(format!("cannot read grants: {e}")))?;

        match verify_account_grants(&grants) {
            Err(Error::MissingPermissions { message }) => {
                warn!(%message, "Reapplying grants of the internal account");
                self.engine
                    .apply_default_grants(INTERNAL_ACCOUNT)
                    .map_err(|e| Error::internal(format!("cannot apply grants: {e}")))
            },
            other => other,
        }
    }

    fn set_startup(&self, state: StartupState) {
        let mut startup = self.startup.lock();
        if *startup == StartupState::Starting {
            *startup = state;
        }
        self.startup_cv.notify_all();
    }

    /// Wait until the network task reports ready or failed.
    ///
    /// # Errors
    /// The startup failure, or [`Error::ServiceNotReady`] on timeout.
    pub fn wait_for_startup(&self, timeout: Duration) -> Result<()> {
        let mut startup = self.startup.lock();
        let _ = self.startup_cv.wait_while_for(
            &mut startup,
            |state| *state == StartupState::Starting,
            timeout,
        );
        match &*startup {
            StartupState::Running => Ok(()),
            StartupState::Failed(e) => Err(e.clone()),
            StartupState::Starting => Err(Error::ServiceNotReady {
                message: format!("front-end not ready after {timeout:?}"),
            }),
        }
    }

    #[must_use]
    pub fn startup_state(&self) -> StartupState {
        self.startup.lock().clone()
    }

    /// Admit a freshly accepted socket and hand it to a session worker.
    pub(crate) fn accept_client(self: &Arc<Self>, stream: ClientStream, peer: PeerAddress) {
        let terminating = self.engine.is_terminating() || !self.coordinator.is_running();
        if !self.admission.will_accept(terminating) {
            self.admission.did_reject(RejectReason::TooManyConnections);
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        let id = ConnectionId::new(self.last_connection_id.fetch_add(1, Ordering::SeqCst) + 1);
        let connection = match Connection::new(id, stream, peer) {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                self.admission.revoke();
                error!(error = %e, "Cannot set up connection");
                self.admission.did_reject(RejectReason::AcceptError);
                return;
            },
        };

        self.registry.insert(Arc::clone(&connection));
        self.admission.did_accept();
        debug!(connection_id = %id, peer = %connection.peer(), "Connection accepted");

        let core = Arc::clone(self);
        let task_connection = Arc::clone(&connection);
        if !self.session_scheduler.post(move || run_connection(core, task_connection)) {
            warn!(connection_id = %id, "No session worker available, closing connection");
            if let Some(stream) = connection.take_stream() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            connection.advance(ConnectionState::Closed);
            self.release_connection(&connection);
        }
    }

    /// Remove a finished connection. Only the call that removes it from the
    /// registry releases its admission slot.
    pub(crate) fn release_connection(&self, connection: &Connection) {
        if self.registry.remove(connection.id()).is_some() {
            self.admission.on_closed();
        }
    }

    /// One shutdown poll. Returns whether the accept loop should continue.
    pub(crate) fn on_timer_tick(self: &Arc<Self>) -> bool {
        if self.coordinator.poll(self.exit.is_set(), self.engine.is_terminating()) {
            self.on_verify_server_state();
            return false;
        }
        self.coordinator.is_running()
    }

    fn on_verify_server_state(self: &Arc<Self>) {
        if self.session_scheduler.is_running() {
            let core = Arc::clone(self);
            if !self.session_scheduler.post(move || {
                core.registry.close_all();
            }) {
                warn!("Could not schedule closing of client connections");
            }
        }
        self.stop(true);
    }

    /// Stop the instance. Idempotent.
    ///
    /// The first caller does the work. Later callers wait for it to finish,
    /// except the acceptor timer, which must not wait on itself.
    pub fn stop(&self, from_timer: bool) {
        if !self.coordinator.begin_stop() {
            if !from_timer && !self.coordinator.wait_stopped(STOP_WAIT) {
                warn!("Timed out waiting for the front-end to stop");
            }
            return;
        }

        info!(from_timer, "Stopping front-end");
        self.cancel.cancel();
        self.registry.close_all();
        self.session_scheduler.stop();
        self.network_scheduler.stop();

        let leftovers = self.registry.drain();
        for connection in &leftovers {
            connection.terminate();
            connection.advance(ConnectionState::Closed);
            self.admission.on_closed();
        }
        if !leftovers.is_empty() {
            debug!(count = leftovers.len(), "Released connections never served");
        }

        self.set_startup(StartupState::Failed(Error::ShuttingDown));
        self.coordinator.mark_stopped();
        info!("Front-end stopped");
    }

    /// Apply pool and connection-limit settings.
    pub fn apply_worker_settings(&self, settings: &LiveSettings) {
        self.admission.set_max_connections(settings.max_connections);
        let applied = self.session_scheduler.set_num_workers(settings.min_worker_threads);
        if applied != settings.min_worker_threads {
            self.live.write_back_min_worker_threads(applied);
        }
        self.session_scheduler.set_idle_worker_timeout(settings.idle_worker_timeout());
    }

    /// Apply per-connection timeouts and the message size limit.
    pub fn apply_timeouts(&self, settings: &LiveSettings) {
        self.interactive_timeout_secs.store(settings.interactive_timeout_secs, Ordering::SeqCst);
        self.connect_timeout_secs.store(settings.connect_timeout_secs, Ordering::SeqCst);
        self.max_allowed_packet.store(settings.max_allowed_packet, Ordering::SeqCst);
    }

    /// Apply every live setting at once.
    pub fn on_config_changed(&self, settings: &LiveSettings) {
        self.apply_worker_settings(settings);
        self.apply_timeouts(settings);
    }

    #[must_use]
    pub fn protocol_limits(&self) -> ProtocolLimits {
        ProtocolLimits {
            interactive_timeout: Duration::from_secs(
                self.interactive_timeout_secs.load(Ordering::SeqCst),
            ),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.load(Ordering::SeqCst)),
            max_allowed_packet: self.max_allowed_packet.load(Ordering::SeqCst),
        }
    }

    /// Document id for `connection`, through its session when it has one.
    #[must_use]
    pub fn document_id(
        &self,
        connection: Option<ConnectionId>,
        offset: u16,
        increment: u16,
    ) -> String {
        let vars = IdVariables::new(self.document_id_prefix, offset, increment);
        let session = connection
            .and_then(|id| self.registry.get(id))
            .and_then(|connection| connection.session());
        match session {
            Some(session) => session.documents().generate_id(vars),
            None => self.document_generator.generate(vars),
        }
    }

    /// Prepared statement id of `client_stmt_id` on `connection`.
    #[must_use]
    pub fn prepared_statement_id(
        &self,
        connection: ConnectionId,
        client_stmt_id: u32,
    ) -> Option<u32> {
        self.registry.get(connection)?.session()?.statements().lookup(client_stmt_id)
    }

    /// Zero the status counters and restart connection numbering.
    fn reset_globals(&self) {
        self.status.reset();
        self.last_connection_id.store(0, Ordering::SeqCst);
        debug!("Global counters reset");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.coordinator.is_running()
    }

    #[must_use]
    pub fn shutdown_state(&self) -> ShutdownState {
        self.coordinator.state()
    }

    #[must_use]
    pub fn property(&self, id: PropertyId) -> String {
        self.properties.get(id)
    }

    #[must_use]
    pub fn unix_socket(&self) -> String {
        self.properties.get(PropertyId::UnixSocket)
    }

    #[must_use]
    pub fn tcp_port(&self) -> String {
        self.properties.get(PropertyId::TcpPort)
    }

    #[must_use]
    pub fn tcp_bind_address(&self) -> String {
        self.properties.get(PropertyId::TcpBindAddress)
    }

    #[must_use]
    pub fn tls(&self) -> TlsContext {
        self.tls.read().clone()
    }

    #[must_use]
    pub const fn backlog(&self) -> u32 {
        self.backlog
    }

    #[must_use]
    pub const fn document_id_prefix(&self) -> u16 {
        self.document_id_prefix
    }

    #[must_use]
    pub fn document_generator(&self) -> Arc<DocumentIdGenerator> {
        Arc::clone(&self.document_generator)
    }

    #[must_use]
    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    #[must_use]
    pub fn status(&self) -> &GlobalStatus {
        &self.status
    }

    #[must_use]
    pub const fn auth(&self) -> &AuthenticationRegistry {
        &self.auth
    }

    #[must_use]
    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    #[must_use]
    pub const fn protocol(&self) -> &Arc<dyn ProtocolHandler> {
        &self.protocol
    }

    #[must_use]
    pub const fn session_scheduler(&self) -> &Scheduler {
        &self.session_scheduler
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Owner of the server instance.
pub struct ServerHandle {
    slot: RwLock<Option<Arc<ServerCore>>>,
    exit: ExitFlag,
    live: Arc<LiveConfig>,
}

impl ServerHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            exit: ExitFlag::new(),
            live: Arc::new(LiveConfig::new(LiveSettings::default())),
        }
    }

    /// Live settings; updates reach a running instance through its callbacks.
    #[must_use]
    pub const fn live_config(&self) -> &Arc<LiveConfig> {
        &self.live
    }

    /// Start an instance serving the bundled line protocol.
    ///
    /// # Errors
    /// See [`ServerHandle::start_with_protocol`].
    pub fn start(&self, config: FrontendConfig, engine: Arc<dyn Engine>) -> Result<()> {
        self.start_with_protocol(config, engine, Arc::new(TextProtocol::new()))
    }

    /// Start an instance. Returns once the network task is posted; use
    /// [`ServerCore::wait_for_startup`] to wait for the listeners.
    ///
    /// # Errors
    /// An instance is already installed, the bind address is invalid, or
    /// the live limits fail validation.
    pub fn start_with_protocol(
        &self,
        config: FrontendConfig,
        engine: Arc<dyn Engine>,
        protocol: Arc<dyn ProtocolHandler>,
    ) -> Result<()> {
        if self.slot.read().is_some() {
            return Err(Error::internal("front-end instance already started"));
        }
        self.live.update(config.limits.clone())?;

        let mut slot = self.slot.write();
        if slot.is_some() {
            return Err(Error::internal("front-end instance already started"));
        }
        self.exit.clear();
        let live = Arc::clone(&self.live);
        let core = ServerCore::new(config, engine, protocol, live, self.exit.clone())?;
        core.launch()?;
        info!(backlog = core.backlog(), "Front-end instance started");
        *slot = Some(core);
        Ok(())
    }

    /// Read access to the running instance.
    ///
    /// # Errors
    /// [`Error::NotInitialized`] without an instance, [`Error::ShuttingDown`]
    /// once shutdown has begun.
    pub fn get(&self) -> Result<MappedRwLockReadGuard<'_, ServerCore>> {
        let core = RwLockReadGuard::try_map(self.slot.read(), |slot| slot.as_deref())
            .map_err(|_| Error::NotInitialized)?;
        if !core.is_running() {
            return Err(Error::ShuttingDown);
        }
        Ok(core)
    }

    /// The installed instance in any state.
    #[must_use]
    pub fn instance(&self) -> Option<Arc<ServerCore>> {
        self.slot.read().clone()
    }

    /// Ask the instance to stop on its next timer tick.
    pub fn request_exit(&self) {
        self.exit.set();
    }

    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.exit.is_set()
    }

    /// Whether no instance is serving: none installed, or it has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.slot
            .read()
            .as_ref()
            .map_or(true, |core| core.shutdown_state() == ShutdownState::Stopped)
    }

    /// Stop and destroy the instance.
    pub fn exit(&self) {
        self.exit.set();
        let core = self.slot.read().clone();
        if let Some(core) = core {
            core.stop(false);
        }
        self.live.clear_callbacks();
        if self.slot.write().take().is_some() {
            info!("Front-end instance destroyed");
        }
    }

    /// Reset counters and connection numbering of the installed instance.
    ///
    /// # Errors
    /// [`Error::NotInitialized`] without an instance.
    pub fn reset(&self) -> Result<()> {
        let slot = self.slot.write();
        let core = slot.as_ref().ok_or(Error::NotInitialized)?;
        core.reset_globals();
        Ok(())
    }
}

impl Default for ServerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.slot.get_mut().is_some() {
            self.exit();
        }
    }
}
