//! The kernel lifecycle manager.
//!
//! A [`KernelManager`] owns one provisioner and one connection descriptor,
//! and drives the kernel through its lifecycle:
//!
//! ```text
//! Unstarted -> Starting -> Running -> (Restarting | ShuttingDown) -> Dead
//! ```
//!
//! Only one lifecycle operation runs at a time per manager; concurrent
//! callers wait on an internal mutex. Transitions are published on a watch
//! channel for any attached listener.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientConfig, KernelClient};
use crate::connection::ConnectionInfo;
use crate::context::ClientContext;
use crate::kernelspec::{self, KernelInterruptMode, KernelSpec};
use crate::provisioning::{KernelProvisioner, KernelSignal, LaunchContext};
use crate::session::Session;
use crate::wire_protocol::{InterruptRequest, MessageType, ShutdownRequest};
use crate::Error;

/// Where a kernel is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    /// No kernel process has been launched yet.
    Unstarted,

    /// The kernel process is launching and not yet answering.
    Starting,

    /// The kernel is up and reachable.
    Running,

    /// The kernel is being torn down before a relaunch.
    Restarting,

    /// The kernel is being torn down for good.
    ShuttingDown,

    /// The kernel process is gone and nothing will relaunch it.
    Dead,
}

/// Watches lifecycle transitions as the manager publishes them.
pub type KernelStateListener = watch::Receiver<LifecycleState>;

/// Tuning knobs for one kernel manager.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Name of the provisioner to launch the kernel with.
    pub provisioner: String,

    /// How long to wait for a launched kernel to answer its heartbeat.
    pub startup_timeout: Duration,

    /// How long to wait for a `shutdown_reply` and process exit.
    pub shutdown_timeout: Duration,

    /// How long the graceful phase of a restart may take.
    pub restart_timeout: Duration,

    /// Relaunch the kernel automatically if its process exits while the
    /// manager believes it is running.
    pub autorestart: bool,

    /// How many consecutive automatic restarts to attempt before giving
    /// the kernel up as dead.
    pub max_restarts: u32,

    /// A kernel that stays up this long resets the restart counter.
    pub stable_after: Duration,

    /// Keep the connection descriptor in memory only, never on disk.
    pub ephemeral: bool,

    /// IP to bind the kernel's sockets on.
    pub ip: String,

    /// Configuration for the kernel client this manager produces.
    pub client: ClientConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            provisioner: "local".into(),
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            restart_timeout: Duration::from_secs(5),
            autorestart: false,
            max_restarts: 5,
            stable_after: Duration::from_secs(10),
            ephemeral: false,
            ip: "127.0.0.1".into(),
            client: ClientConfig::default(),
        }
    }
}

struct ManagerInner {
    provisioner: Box<dyn KernelProvisioner>,
    restarts: u32,
    started_at: Option<Instant>,
}

struct ManagerCore {
    kernel_name: String,
    spec: KernelSpec,
    resource_dir: Option<PathBuf>,
    config: ManagerConfig,
    inner: Mutex<ManagerInner>,
    connection: RwLock<Option<ConnectionInfo>>,
    connection_file: RwLock<Option<PathBuf>>,
    client: RwLock<Option<KernelClient>>,
    state_tx: watch::Sender<LifecycleState>,
    monitor_started: AtomicBool,
    cancel: CancellationToken,
}

/// Owns one kernel's provisioner, connection descriptor, and client, and
/// serialises lifecycle operations on them.
///
/// The manager is a cheap handle; clones share the same kernel.
#[derive(Clone)]
pub struct KernelManager {
    core: Arc<ManagerCore>,
}

impl KernelManager {
    /// Create a manager for one kernel spec. No process is launched until
    /// [`start_kernel`](Self::start_kernel) is called.
    pub fn new(
        kernel_name: impl Into<String>,
        spec: KernelSpec,
        resource_dir: Option<PathBuf>,
        config: ManagerConfig,
        context: &ClientContext,
    ) -> Result<Self, Error> {
        let provisioner = context.provisioners().create(&config.provisioner)?;
        let (state_tx, _) = watch::channel(LifecycleState::Unstarted);
        Ok(Self {
            core: Arc::new(ManagerCore {
                kernel_name: kernel_name.into(),
                spec,
                resource_dir,
                config,
                inner: Mutex::new(ManagerInner {
                    provisioner,
                    restarts: 0,
                    started_at: None,
                }),
                connection: RwLock::new(None),
                connection_file: RwLock::new(None),
                client: RwLock::new(None),
                state_tx,
                monitor_started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Name of the kernel spec this manager launches.
    pub fn kernel_name(&self) -> &str {
        &self.core.kernel_name
    }

    /// The manager's current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.core.state_tx.borrow()
    }

    /// Watch lifecycle transitions as they happen.
    pub fn state_listener(&self) -> KernelStateListener {
        self.core.state_tx.subscribe()
    }

    /// The client connected to the running kernel, if any.
    pub fn client(&self) -> Option<KernelClient> {
        self.core.client.read().expect("client lock").clone()
    }

    /// The connection descriptor, once one has been established.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.core.connection.read().expect("connection lock").clone()
    }

    /// Path of the connection file, unless the descriptor is ephemeral.
    pub fn connection_file(&self) -> Option<PathBuf> {
        self.core
            .connection_file
            .read()
            .expect("connection file lock")
            .clone()
    }

    /// Whether the kernel process is currently alive.
    pub async fn is_alive(&self) -> bool {
        if self.state() != LifecycleState::Running {
            return false;
        }
        let mut inner = self.core.inner.lock().await;
        matches!(inner.provisioner.poll().await, Ok(None))
    }

    /// Launch the kernel and wait until it is reachable.
    ///
    /// Writes the connection file (unless configured ephemeral), launches
    /// through the provisioner, and waits until the process is alive and
    /// the heartbeat echoes, all within the startup timeout. Any failure
    /// cleans up, transitions to `Dead`, and surfaces as
    /// [`Error::StartFailed`].
    pub async fn start_kernel(&self) -> Result<(), Error> {
        let mut inner = self.core.inner.lock().await;
        match self.state() {
            LifecycleState::Unstarted | LifecycleState::Dead => {}
            state => {
                return Err(Error::StartFailed(format!(
                    "kernel {:?} is already {state}",
                    self.core.kernel_name
                )))
            }
        }
        self.core.set_state(LifecycleState::Starting);

        match self.core.launch_locked(&mut inner).await {
            Ok(()) => {
                inner.restarts = 0;
                inner.started_at = Some(Instant::now());
                self.core.set_state(LifecycleState::Running);
                if self.core.config.autorestart {
                    self.spawn_monitor();
                }
                Ok(())
            }
            Err(err) => {
                inner.provisioner.cleanup(false).await.ok();
                self.core.drop_client(true);
                self.core.set_state(LifecycleState::Dead);
                Err(match err {
                    Error::StartFailed(_) | Error::Cancelled => err,
                    other => Error::StartFailed(other.to_string()),
                })
            }
        }
    }

    /// Interrupt the running computation without changing state.
    ///
    /// Depending on the kernel spec's interrupt mode, either a SIGINT is
    /// delivered to the process or an `interrupt_request` is sent on the
    /// control channel.
    pub async fn interrupt_kernel(&self) -> Result<(), Error> {
        let mut inner = self.core.inner.lock().await;
        if self.state() != LifecycleState::Running {
            return Err(Error::NotRunning(self.state().to_string()));
        }
        match self.core.spec.interrupt_mode {
            KernelInterruptMode::Signal => {
                inner.provisioner.send_signal(KernelSignal::Interrupt).await
            }
            KernelInterruptMode::Message => {
                let client = self
                    .client()
                    .ok_or(Error::NotRunning("no client".into()))?;
                let message = client
                    .session()
                    .message(MessageType::InterruptRequest, InterruptRequest {});
                // The reply is informational; do not block on it.
                drop(client.send_control(message).await?);
                Ok(())
            }
        }
    }

    /// Tear the kernel down and relaunch it on the same connection file.
    ///
    /// The graceful phase asks the kernel to shut down and escalates
    /// through SIGTERM to SIGKILL if it lingers past the restart timeout;
    /// with `now` set the graceful phase is skipped.
    pub async fn restart_kernel(&self, now: bool) -> Result<(), Error> {
        let mut inner = self.core.inner.lock().await;
        if self.state() != LifecycleState::Running {
            return Err(Error::NotRunning(self.state().to_string()));
        }
        self.core.set_state(LifecycleState::Restarting);

        self.core
            .stop_locked(&mut inner, now, true, self.core.config.restart_timeout)
            .await;
        inner.provisioner.cleanup(true).await.ok();
        self.core.drop_client(false);

        match self.core.launch_locked(&mut inner).await {
            Ok(()) => {
                inner.restarts = 0;
                inner.started_at = Some(Instant::now());
                self.core.set_state(LifecycleState::Running);
                Ok(())
            }
            Err(err) => {
                inner.provisioner.cleanup(false).await.ok();
                self.core.drop_client(true);
                self.core.set_state(LifecycleState::Dead);
                Err(Error::StartFailed(err.to_string()))
            }
        }
    }

    /// Shut the kernel down for good.
    ///
    /// Sends `shutdown_request{restart: false}` on the control channel and
    /// waits for the reply within the shutdown timeout, then terminates,
    /// kills, and cleans up. With `now` set the request step is skipped.
    pub async fn shutdown_kernel(&self, now: bool) -> Result<(), Error> {
        let mut inner = self.core.inner.lock().await;
        match self.state() {
            LifecycleState::Dead => return Ok(()),
            LifecycleState::Running | LifecycleState::Starting => {}
            state => return Err(Error::NotRunning(state.to_string())),
        }
        self.core.set_state(LifecycleState::ShuttingDown);

        self.core
            .stop_locked(&mut inner, now, false, self.core.config.shutdown_timeout)
            .await;
        inner.provisioner.cleanup(false).await.ok();
        *self
            .core
            .connection_file
            .write()
            .expect("connection file lock") = None;
        self.core.drop_client(true);
        self.core.set_state(LifecycleState::Dead);
        Ok(())
    }

    fn spawn_monitor(&self) {
        if self.core.monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = Arc::downgrade(&self.core);
        tokio::spawn(async move {
            run_monitor(core).await;
        });
    }
}

impl ManagerCore {
    fn set_state(&self, state: LifecycleState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("kernel {:?}: {previous} -> {state}", self.kernel_name);
        }
    }

    /// Replace the current client, optionally marking it dead first so
    /// pending requests fail instead of hanging.
    fn drop_client(&self, died: bool) {
        let old = self.client.write().expect("client lock").take();
        if let Some(client) = old {
            if died {
                client.notify_dead();
            }
            client.close();
        }
    }

    /// Establish the connection descriptor, launch the process, and wait
    /// until the kernel is reachable. Caller holds the lifecycle lock.
    async fn launch_locked(&self, inner: &mut ManagerInner) -> Result<(), Error> {
        let connection = {
            let existing = self.connection.read().expect("connection lock").clone();
            match existing {
                Some(info) => info,
                None => {
                    let info = ConnectionInfo::ephemeral(
                        &self.config.ip,
                        Some(self.kernel_name.clone()),
                    )
                    .await?;
                    *self.connection.write().expect("connection lock") = Some(info.clone());
                    info
                }
            }
        };

        let connection_file = if self.config.ephemeral {
            None
        } else {
            let existing = self
                .connection_file
                .read()
                .expect("connection file lock")
                .clone();
            let path = match existing {
                Some(path) => path,
                None => {
                    let dir = kernelspec::runtime_dir();
                    tokio::fs::create_dir_all(&dir).await?;
                    let path = dir.join(format!(
                        "kernel-{}.json",
                        uuid::Uuid::new_v4().simple()
                    ));
                    *self
                        .connection_file
                        .write()
                        .expect("connection file lock") = Some(path.clone());
                    path
                }
            };
            connection.write(&path).await?;
            Some(path)
        };

        inner.provisioner.load_connection_info(&connection);
        let context = LaunchContext {
            kernel_name: self.kernel_name.clone(),
            spec: self.spec.clone(),
            connection_file,
            resource_dir: self.resource_dir.clone(),
        };
        let command = inner.provisioner.pre_launch(&context).await?;
        inner.provisioner.launch(command, &context).await?;

        let deadline = Instant::now() + self.config.startup_timeout;
        let client = loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(code) = inner.provisioner.poll().await? {
                return Err(Error::StartFailed(format!(
                    "kernel process exited with code {code} during startup"
                )));
            }
            if Instant::now() >= deadline {
                return Err(Error::StartFailed(format!(
                    "kernel did not become ready within {:?}",
                    self.config.startup_timeout
                )));
            }
            // The kernel may not have bound its sockets yet; keep trying.
            match KernelClient::connect(
                &connection,
                Session::new(&connection.key),
                self.config.client.clone(),
            )
            .await
            {
                Ok(client) => break client,
                Err(err) => {
                    debug!("kernel not reachable yet: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        };

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        client.wait_for_heartbeat(remaining).await?;

        *self.client.write().expect("client lock") = Some(client);
        Ok(())
    }

    /// Stop the kernel process, gracefully unless `now`, escalating from
    /// a shutdown request through SIGTERM to SIGKILL. Caller holds the
    /// lifecycle lock. Best-effort: the process is gone when this
    /// returns.
    async fn stop_locked(
        &self,
        inner: &mut ManagerInner,
        now: bool,
        restart: bool,
        timeout: Duration,
    ) {
        if !now {
            let client = self.client.read().expect("client lock").clone();
            if let Some(client) = client {
                let message = client
                    .session()
                    .message(MessageType::ShutdownRequest, ShutdownRequest { restart });
                match client.send_control(message).await {
                    Ok(pending) => {
                        if let Err(err) = pending.wait(timeout).await {
                            debug!("no shutdown reply: {err}");
                        }
                    }
                    Err(err) => debug!("could not send shutdown request: {err}"),
                }
            }
            if inner.provisioner.wait(timeout).await.is_ok() {
                return;
            }
        }

        if matches!(inner.provisioner.poll().await, Ok(Some(_))) {
            return;
        }
        warn!(
            "kernel {:?} did not exit on request, escalating",
            self.kernel_name
        );
        inner.provisioner.terminate().await.ok();
        if inner.provisioner.wait(timeout).await.is_err() {
            inner.provisioner.kill().await.ok();
            inner.provisioner.wait(Duration::from_secs(5)).await.ok();
        }
    }
}

/// Watch the provisioner for unexpected exits and relaunch, up to the
/// configured number of consecutive restarts.
async fn run_monitor(core: Weak<ManagerCore>) {
    loop {
        let sleep = tokio::time::sleep(Duration::from_secs(1));
        {
            let Some(core) = core.upgrade() else { return };
            tokio::select! {
                _ = core.cancel.cancelled() => return,
                _ = sleep => {}
            }
        }

        let Some(core) = core.upgrade() else { return };
        if *core.state_tx.borrow() != LifecycleState::Running {
            continue;
        }
        // Never contend with an explicit lifecycle operation.
        let Ok(mut inner) = core.inner.try_lock() else {
            continue;
        };
        if *core.state_tx.borrow() != LifecycleState::Running {
            continue;
        }
        let code = match inner.provisioner.poll().await {
            Ok(Some(code)) => code,
            _ => continue,
        };

        warn!(
            "kernel {:?} exited unexpectedly with code {code}",
            core.kernel_name
        );
        core.drop_client(true);

        if let Some(started_at) = inner.started_at {
            if started_at.elapsed() >= core.config.stable_after {
                inner.restarts = 0;
            }
        }
        if inner.restarts >= core.config.max_restarts {
            warn!(
                "kernel {:?} died {} consecutive times, giving up",
                core.kernel_name, inner.restarts
            );
            inner.provisioner.cleanup(false).await.ok();
            core.set_state(LifecycleState::Dead);
            continue;
        }
        inner.restarts += 1;
        core.set_state(LifecycleState::Restarting);
        inner.provisioner.cleanup(true).await.ok();
        match core.launch_locked(&mut inner).await {
            Ok(()) => {
                inner.started_at = Some(Instant::now());
                core.set_state(LifecycleState::Running);
            }
            Err(err) => {
                warn!("automatic restart failed: {err}");
                inner.provisioner.cleanup(false).await.ok();
                core.drop_client(true);
                core.set_state(LifecycleState::Dead);
            }
        }
    }
}

impl Drop for ManagerCore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
