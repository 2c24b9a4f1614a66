//! The asynchronous kernel client.
//!
//! A [`KernelClient`] owns the five channel sockets of one kernel and runs
//! a task per channel. Requests are correlated with replies through the
//! `parent_header.msg_id` of the reply; iopub broadcasts fan out to any
//! number of bounded subscriptions; kernel-initiated stdin requests are
//! served by exactly one consumer. Blocking conveniences (execute and wait
//! for idle, kernel info, completion) are layered on top of the
//! asynchronous surface, each with an explicit timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::channels::{self, Channel, HeartbeatChannel, StdinChannel};
use crate::connection::ConnectionInfo;
use crate::session::Session;
use crate::wire_protocol::{
    CompleteRequest, ExecuteRequest, Header, InputRequest, InspectRequest, IsCompleteRequest,
    KernelInfoReply, KernelInfoRequest, Message, MessageType, Reply, Status,
};
use crate::Error;

pub use crate::wire_protocol::KernelStatus;

/// The client's view of the kernel's execution state.
///
/// Updated strictly from iopub `status` messages, except for `Dead`, which
/// is synthesized by the kernel manager on unexpected exit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionState {
    /// The kernel is starting up.
    Starting,

    /// The kernel is ready to execute code.
    Idle,

    /// The kernel is currently executing code.
    Busy,

    /// The kernel process is gone.
    Dead,
}

impl From<KernelStatus> for ExecutionState {
    fn from(status: KernelStatus) -> Self {
        match status {
            KernelStatus::Starting => ExecutionState::Starting,
            KernelStatus::Idle => ExecutionState::Idle,
            KernelStatus::Busy => ExecutionState::Busy,
        }
    }
}

/// One execution-state transition, as observed on iopub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionUpdate {
    /// The new state.
    pub state: ExecutionState,

    /// The request that caused the transition, if the kernel named one.
    pub parent_msg_id: Option<String>,
}

/// Tuning knobs for a client connection.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Capacity of each iopub subscription before drop-oldest kicks in.
    pub iopub_buffer: usize,

    /// How long the stdin server waits for a consumer to answer an
    /// `input_request` before telling the kernel input is unavailable.
    pub stdin_timeout: Duration,

    /// Interval between heartbeat pings.
    pub hb_interval: Duration,

    /// How long without a pong before the heartbeat is considered stalled.
    pub hb_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            iopub_buffer: 64,
            stdin_timeout: Duration::from_secs(60),
            hb_interval: Duration::from_secs(3),
            hb_timeout: Duration::from_secs(1),
        }
    }
}

/// Running totals of everything the client dropped or rejected.
///
/// No message disappears silently: every dropped frame lands in one of
/// these counters, retrievable with [`KernelClient::diagnostics`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientDiagnostics {
    /// Messages rejected for a bad HMAC signature.
    pub invalid_signatures: u64,

    /// Shell messages rejected as replays of an earlier signature.
    pub duplicate_signatures: u64,

    /// Multipart payloads that did not follow the wire format.
    pub malformed_frames: u64,

    /// Replies whose parent id matched no pending request.
    pub unknown_parents: u64,

    /// Iopub messages displaced from a slow subscriber's queue.
    pub iopub_dropped: u64,

    /// Stdin requests that went unanswered.
    pub stdin_failures: u64,
}

#[derive(Default)]
struct Diagnostics {
    invalid_signatures: AtomicU64,
    duplicate_signatures: AtomicU64,
    malformed_frames: AtomicU64,
    unknown_parents: AtomicU64,
    iopub_dropped: AtomicU64,
    stdin_failures: AtomicU64,
}

impl Diagnostics {
    fn snapshot(&self) -> ClientDiagnostics {
        ClientDiagnostics {
            invalid_signatures: self.invalid_signatures.load(Ordering::Relaxed),
            duplicate_signatures: self.duplicate_signatures.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_parents: self.unknown_parents.load(Ordering::Relaxed),
            iopub_dropped: self.iopub_dropped.load(Ordering::Relaxed),
            stdin_failures: self.stdin_failures.load(Ordering::Relaxed),
        }
    }

    /// Count a decode failure; returns true if the receive loop should
    /// keep going.
    fn record_decode_error(&self, err: &Error, channel: Channel) -> bool {
        match err {
            Error::InvalidSignature { .. } => {
                self.invalid_signatures.fetch_add(1, Ordering::Relaxed);
                warn!("dropping {channel} message with invalid signature");
                true
            }
            Error::DuplicateSignature { .. } => {
                self.duplicate_signatures.fetch_add(1, Ordering::Relaxed);
                warn!("dropping replayed {channel} message");
                true
            }
            Error::MalformedFrame { reason, .. } => {
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                warn!("dropping malformed {channel} frame: {reason}");
                true
            }
            // Socket-level failures end the loop.
            _ => false,
        }
    }
}

struct Subscriber {
    tx: async_channel::Sender<Message>,
    dropped: Arc<AtomicU64>,
}

/// A bounded subscription to the kernel's iopub broadcasts.
///
/// If messages arrive faster than they are consumed, the oldest queued
/// message is displaced and counted; the client's receive loop never
/// blocks on a slow subscriber.
pub struct IopubSubscription {
    id: u64,
    rx: async_channel::Receiver<Message>,
    dropped: Arc<AtomicU64>,
    subscribers: Arc<DashMap<u64, Subscriber>>,
}

impl IopubSubscription {
    /// Receive the next broadcast message.
    pub async fn recv(&self) -> Result<Message, Error> {
        self.rx
            .recv()
            .await
            .map_err(|_| Error::ChannelClosed(Channel::Iopub))
    }

    /// Receive an immediate message without waiting.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// How many messages have been displaced from this subscription.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for IopubSubscription {
    fn drop(&mut self) {
        self.subscribers.remove(&self.id);
    }
}

/// An `input_request` from the kernel, waiting for exactly one answer.
pub struct StdinRequest {
    /// The prompt and echo settings sent by the kernel.
    pub content: InputRequest,
    reply_tx: oneshot::Sender<String>,
}

impl StdinRequest {
    /// Answer the kernel's prompt.
    ///
    /// Fails with [`Error::ChannelClosed`] if the request already expired
    /// and the kernel was told input is unavailable.
    pub fn respond(self, value: impl Into<String>) -> Result<(), Error> {
        self.reply_tx
            .send(value.into())
            .map_err(|_| Error::ChannelClosed(Channel::Stdin))
    }
}

/// Receives a reply from a previous shell or control request.
///
/// Dropping the handle cancels the request: the pending slot is removed
/// and a late reply is discarded. The kernel is not informed; use the
/// control channel's interrupt operation for real cancellation.
pub struct PendingReply {
    pending: Arc<DashMap<String, oneshot::Sender<Message>>>,
    rx: oneshot::Receiver<Message>,
    msg_id: String,
    channel: Channel,
    state_rx: watch::Receiver<ExecutionUpdate>,
    cancel: CancellationToken,
}

impl PendingReply {
    /// The id of the request awaiting its reply.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Wait for the reply, up to the timeout.
    ///
    /// A zero timeout polls without waiting. On timeout the handle is
    /// dropped, so a reply arriving later is discarded.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message, Error> {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, &mut self.rx) => result,
        };
        match result {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => {
                if self.state_rx.borrow().state == ExecutionState::Dead {
                    Err(Error::KernelDied)
                } else {
                    Err(Error::ChannelClosed(self.channel))
                }
            }
            Err(_) => Err(Error::timeout(self.channel, Some(self.msg_id.clone()))),
        }
    }

    /// Wait for the reply and deserialize its content.
    pub async fn wait_typed<U: DeserializeOwned>(
        self,
        timeout: Duration,
    ) -> Result<Message<Reply<U>>, Error> {
        self.wait(timeout).await?.into_typed()
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // This ensures that we don't leak memory by leaving the slot in
        // the pending table.
        self.pending.remove(&self.msg_id);
    }
}

/// A connected client for one kernel, cloneable and cheap to share.
///
/// Functions will block if disconnected or return an error after the
/// client has been closed.
#[derive(Clone)]
pub struct KernelClient {
    session: Arc<Session>,
    shell_tx: async_channel::Sender<Message>,
    control_tx: async_channel::Sender<Message>,
    pending: Arc<DashMap<String, oneshot::Sender<Message>>>,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    subscriber_ids: Arc<AtomicU64>,
    stdin_rx: async_channel::Receiver<StdinRequest>,
    state_tx: watch::Sender<ExecutionUpdate>,
    state_rx: watch::Receiver<ExecutionUpdate>,
    beating_rx: watch::Receiver<bool>,
    last_shell_request: Arc<Mutex<Option<String>>>,
    diagnostics: Arc<Diagnostics>,
    config: ClientConfig,
    cancel: CancellationToken,
    _drop_guard: Arc<DropGuard>,
}

impl KernelClient {
    /// Connect all five channels of a kernel and start the channel tasks.
    pub async fn connect(
        info: &ConnectionInfo,
        session: Session,
        config: ClientConfig,
    ) -> Result<Self, Error> {
        let session = Arc::new(session);

        let mut shell = channels::connect_shell(info, session.clone()).await?;
        let mut control = channels::connect_control(info, session.clone()).await?;
        let mut iopub = channels::connect_iopub(info, session.clone()).await?;
        let stdin = channels::connect_stdin(info, session.clone()).await?;
        let heartbeat = HeartbeatChannel::connect(info).await?;

        let (shell_tx, shell_rx) = async_channel::bounded::<Message>(8);
        let (control_tx, control_rx) = async_channel::bounded::<Message>(8);
        let (stdin_requests_tx, stdin_requests_rx) = async_channel::bounded::<StdinRequest>(1);
        let pending: Arc<DashMap<String, oneshot::Sender<Message>>> = Arc::new(DashMap::new());
        let subscribers: Arc<DashMap<u64, Subscriber>> = Arc::new(DashMap::new());
        let (state_tx, state_rx) = watch::channel(ExecutionUpdate {
            state: ExecutionState::Starting,
            parent_msg_id: None,
        });
        let (beating_tx, beating_rx) = watch::channel(false);
        let diagnostics = Arc::new(Diagnostics::default());
        let cancel = CancellationToken::new();

        let client = Self {
            session: session.clone(),
            shell_tx,
            control_tx,
            pending: pending.clone(),
            subscribers: subscribers.clone(),
            subscriber_ids: Arc::new(AtomicU64::new(0)),
            stdin_rx: stdin_requests_rx,
            state_tx: state_tx.clone(),
            state_rx,
            beating_rx,
            last_shell_request: Arc::new(Mutex::new(None)),
            diagnostics: diagnostics.clone(),
            config: config.clone(),
            cancel: cancel.clone(),
            _drop_guard: Arc::new(cancel.clone().drop_guard()),
        };

        let diag = diagnostics.clone();
        let table = pending.clone();
        let shell_fut = async move {
            // Send and receive shell messages.
            loop {
                tokio::select! {
                    outbound = shell_rx.recv() => match outbound {
                        Ok(message) => {
                            if let Err(err) = shell.send(&message).await {
                                warn!("error sending shell message: {err}");
                            }
                        }
                        Err(_) => break,
                    },
                    inbound = shell.recv() => match inbound {
                        Ok(message) => deliver_reply(&table, &diag, message, Channel::Shell),
                        Err(err) => {
                            if !diag.record_decode_error(&err, Channel::Shell) {
                                warn!("shell channel failed: {err}");
                                break;
                            }
                        }
                    },
                }
            }
        };

        let diag = diagnostics.clone();
        let table = pending.clone();
        let control_fut = async move {
            // Send and receive control messages.
            loop {
                tokio::select! {
                    outbound = control_rx.recv() => match outbound {
                        Ok(message) => {
                            if let Err(err) = control.send(&message).await {
                                warn!("error sending control message: {err}");
                            }
                        }
                        Err(_) => break,
                    },
                    inbound = control.recv() => match inbound {
                        Ok(message) => deliver_reply(&table, &diag, message, Channel::Control),
                        Err(err) => {
                            if !diag.record_decode_error(&err, Channel::Control) {
                                warn!("control channel failed: {err}");
                                break;
                            }
                        }
                    },
                }
            }
        };

        let diag = diagnostics.clone();
        let subs = subscribers.clone();
        let iopub_fut = async move {
            // Receive iopub broadcasts, tracking execution state.
            loop {
                match iopub.recv().await {
                    Ok(message) => {
                        if message.header.msg_type == MessageType::Status {
                            if let Ok(status) = message.clone().into_typed::<Status>() {
                                let _ = state_tx.send(ExecutionUpdate {
                                    state: status.content.execution_state.into(),
                                    parent_msg_id: status.parent_msg_id().map(str::to_string),
                                });
                            }
                        }
                        broadcast_iopub(&subs, &diag, message);
                    }
                    Err(err) => {
                        if !diag.record_decode_error(&err, Channel::Iopub) {
                            warn!("iopub channel failed: {err}");
                            break;
                        }
                    }
                }
            }
        };

        let diag = diagnostics.clone();
        let stdin_session = session.clone();
        let stdin_timeout = config.stdin_timeout;
        let stdin_cancel = cancel.clone();
        let stdin_fut = async move {
            serve_stdin_channel(
                stdin,
                stdin_session,
                stdin_requests_tx,
                stdin_timeout,
                stdin_cancel,
                diag,
            )
            .await;
        };

        let hb_interval = config.hb_interval;
        let hb_timeout = config.hb_timeout;
        let hb_cancel = cancel.clone();
        let hb_fut = async move {
            run_heartbeat(heartbeat, beating_tx, hb_interval, hb_timeout, hb_cancel).await;
        };

        let signal = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = async { tokio::join!(shell_fut, control_fut, iopub_fut, stdin_fut, hb_fut) } => {}
                _ = signal.cancelled() => {}
            }
        });

        Ok(client)
    }

    /// The session shared by this client's channels.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// A snapshot of everything the client has dropped or rejected.
    pub fn diagnostics(&self) -> ClientDiagnostics {
        self.diagnostics.snapshot()
    }

    /// The current execution state of the kernel.
    pub fn execution_state(&self) -> ExecutionState {
        self.state_rx.borrow().state
    }

    /// Watch execution-state transitions as they are published on iopub.
    pub fn state_listener(&self) -> watch::Receiver<ExecutionUpdate> {
        self.state_rx.clone()
    }

    /// Mark the kernel as dead, failing all pending requests.
    ///
    /// Called by the kernel manager when the provisioner reports an
    /// unexpected exit; the execution state is never set to `Dead` from
    /// wire traffic.
    pub fn notify_dead(&self) {
        let _ = self.state_tx.send(ExecutionUpdate {
            state: ExecutionState::Dead,
            parent_msg_id: None,
        });
        // Dropping the senders fails every waiting request with KernelDied.
        self.pending.clear();
    }

    /// Close the connection to the kernel, shutting down all channels.
    pub fn close(&self) {
        self.shell_tx.close();
        self.control_tx.close();
        self.cancel.cancel(); // This is the only necessary line, but we
                              // close the queues for good measure.
    }

    /// Send a message to the kernel over the shell channel.
    ///
    /// On success, return a handle that resolves with the reply to this
    /// request on the same channel.
    pub async fn send_shell<T: Serialize>(
        &self,
        message: Message<T>,
    ) -> Result<PendingReply, Error> {
        let pending = self.register(Channel::Shell, &message.header);
        self.shell_tx
            .send(message.into_json())
            .await
            .map_err(|_| self.closed_error(Channel::Shell))?;
        *self.last_shell_request.lock().expect("last request lock") =
            Some(pending.msg_id.clone());
        Ok(pending)
    }

    /// Send a message to the kernel over the control channel.
    pub async fn send_control<T: Serialize>(
        &self,
        message: Message<T>,
    ) -> Result<PendingReply, Error> {
        let pending = self.register(Channel::Control, &message.header);
        self.control_tx
            .send(message.into_json())
            .await
            .map_err(|_| self.closed_error(Channel::Control))?;
        Ok(pending)
    }

    fn register(&self, channel: Channel, header: &Header) -> PendingReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(header.msg_id.clone(), reply_tx);
        PendingReply {
            pending: self.pending.clone(),
            rx: reply_rx,
            msg_id: header.msg_id.clone(),
            channel,
            state_rx: self.state_rx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn closed_error(&self, channel: Channel) -> Error {
        if self.execution_state() == ExecutionState::Dead {
            Error::KernelDied
        } else {
            Error::ChannelClosed(channel)
        }
    }

    /// Subscribe to iopub broadcasts with a bounded buffer.
    pub fn subscribe(&self) -> IopubSubscription {
        let id = self.subscriber_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = async_channel::bounded(self.config.iopub_buffer);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                dropped: dropped.clone(),
            },
        );
        IopubSubscription {
            id,
            rx,
            dropped,
            subscribers: self.subscribers.clone(),
        }
    }

    /// Receive kernel-initiated input requests.
    ///
    /// Each request is delivered to exactly one consumer. Unanswered
    /// requests time out and the kernel is told input is unavailable.
    pub fn stdin_requests(&self) -> async_channel::Receiver<StdinRequest> {
        self.stdin_rx.clone()
    }

    /// Wait until the heartbeat channel has echoed at least one ping.
    pub async fn wait_for_heartbeat(&self, timeout: Duration) -> Result<(), Error> {
        let mut beating = self.beating_rx.clone();
        let wait = async {
            loop {
                if *beating.borrow_and_update() {
                    return Ok(());
                }
                if beating.changed().await.is_err() {
                    return Err(Error::ChannelClosed(Channel::Heartbeat));
                }
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, wait) => {
                result.map_err(|_| Error::timeout(Channel::Heartbeat, None))?
            }
        }
    }

    /// Block until the kernel reports idle for the given request.
    ///
    /// With no request id, waits for an idle transition attributed to the
    /// most recently issued shell request.
    pub async fn wait_for_idle(
        &self,
        msg_id: Option<&str>,
        timeout: Duration,
    ) -> Result<(), Error> {
        let target = msg_id.map(str::to_string).or_else(|| {
            self.last_shell_request
                .lock()
                .expect("last request lock")
                .clone()
        });
        let mut state_rx = self.state_rx.clone();
        let wait = async {
            loop {
                {
                    let update = state_rx.borrow_and_update();
                    match update.state {
                        ExecutionState::Dead => return Err(Error::KernelDied),
                        ExecutionState::Idle
                            if target.is_none() || update.parent_msg_id == target =>
                        {
                            return Ok(())
                        }
                        _ => {}
                    }
                }
                if state_rx.changed().await.is_err() {
                    return Err(Error::ChannelClosed(Channel::Iopub));
                }
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, wait) => {
                result.map_err(|_| Error::timeout(Channel::Iopub, target.clone()))?
            }
        }
    }

    async fn shell_request<T: Serialize, U: DeserializeOwned>(
        &self,
        msg_type: MessageType,
        content: T,
        timeout: Duration,
    ) -> Result<Message<Reply<U>>, Error> {
        let message = self.session.message(msg_type, content);
        let pending = self.send_shell(message).await?;
        pending.wait_typed(timeout).await
    }

    /// Ask the kernel for its implementation and language information.
    ///
    /// Fails with [`Error::ProtocolMismatch`] if the kernel does not speak
    /// a 5.x protocol.
    pub async fn kernel_info(
        &self,
        timeout: Duration,
    ) -> Result<Message<Reply<KernelInfoReply>>, Error> {
        let reply: Message<Reply<KernelInfoReply>> = self
            .shell_request(MessageType::KernelInfoRequest, KernelInfoRequest {}, timeout)
            .await?;
        if let Reply::Ok(info) = &reply.content {
            if !info.protocol_version.starts_with("5.") {
                return Err(Error::ProtocolMismatch(info.protocol_version.clone()));
            }
        }
        Ok(reply)
    }

    /// Execute code and wait only for the shell reply.
    pub async fn execute(
        &self,
        request: ExecuteRequest,
        timeout: Duration,
    ) -> Result<Message<Reply<crate::wire_protocol::ExecuteReply>>, Error> {
        self.shell_request(MessageType::ExecuteRequest, request, timeout)
            .await
    }

    /// Execute code, streaming its iopub output to a handler, and wait for
    /// both the shell reply and the matching idle transition.
    pub async fn execute_interactive(
        &self,
        request: ExecuteRequest,
        mut output_hook: impl FnMut(&Message),
        timeout: Duration,
    ) -> Result<Message<Reply<crate::wire_protocol::ExecuteReply>>, Error> {
        // Subscribe before sending so no output can slip past.
        let subscription = self.subscribe();
        let message = self.session.message(MessageType::ExecuteRequest, request);
        let mut pending = self.send_shell(message).await?;
        let msg_id = pending.msg_id.clone();

        let deadline = Instant::now() + timeout;
        let mut reply = None;
        let mut idle = false;
        while reply.is_none() || !idle {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::timeout(Channel::Shell, Some(msg_id)));
                }
                broadcast = subscription.recv(), if !idle => {
                    let broadcast = broadcast?;
                    if broadcast.parent_msg_id() != Some(msg_id.as_str()) {
                        continue;
                    }
                    if broadcast.header.msg_type == MessageType::Status {
                        if let Ok(status) = broadcast.clone().into_typed::<Status>() {
                            idle = status.content.execution_state == KernelStatus::Idle;
                        }
                    }
                    output_hook(&broadcast);
                }
                inbound = &mut pending.rx, if reply.is_none() => match inbound {
                    Ok(message) => reply = Some(message),
                    Err(_) => {
                        return Err(if self.execution_state() == ExecutionState::Dead {
                            Error::KernelDied
                        } else {
                            Error::ChannelClosed(Channel::Shell)
                        });
                    }
                },
            }
        }
        reply
            .expect("loop exits only with a reply")
            .into_typed()
    }

    /// Request code completions at a cursor position.
    pub async fn complete(
        &self,
        code: impl Into<String>,
        cursor_pos: u32,
        timeout: Duration,
    ) -> Result<Message<Reply<crate::wire_protocol::CompleteReply>>, Error> {
        self.shell_request(
            MessageType::CompleteRequest,
            CompleteRequest {
                code: code.into(),
                cursor_pos,
            },
            timeout,
        )
        .await
    }

    /// Request introspection of code at a cursor position.
    pub async fn inspect(
        &self,
        code: impl Into<String>,
        cursor_pos: u32,
        detail_level: u8,
        timeout: Duration,
    ) -> Result<Message<Reply<crate::wire_protocol::InspectReply>>, Error> {
        self.shell_request(
            MessageType::InspectRequest,
            InspectRequest {
                code: code.into(),
                cursor_pos,
                detail_level,
            },
            timeout,
        )
        .await
    }

    /// Ask whether a block of code is complete and ready to run.
    pub async fn is_complete(
        &self,
        code: impl Into<String>,
        timeout: Duration,
    ) -> Result<Message<Reply<crate::wire_protocol::IsCompleteReply>>, Error> {
        self.shell_request(
            MessageType::IsCompleteRequest,
            IsCompleteRequest { code: code.into() },
            timeout,
        )
        .await
    }

    /// Request entries from the kernel's execution history.
    pub async fn history(
        &self,
        request: crate::wire_protocol::HistoryRequest,
        timeout: Duration,
    ) -> Result<Message<Reply<crate::wire_protocol::HistoryReply>>, Error> {
        self.shell_request(MessageType::HistoryRequest, request, timeout)
            .await
    }

    /// Request information about comms open on the kernel.
    pub async fn comm_info(
        &self,
        target_name: Option<String>,
        timeout: Duration,
    ) -> Result<Message<Reply<crate::wire_protocol::CommInfoReply>>, Error> {
        self.shell_request(
            MessageType::CommInfoRequest,
            crate::wire_protocol::CommInfoRequest { target_name },
            timeout,
        )
        .await
    }

    /// Block until the kernel answers a kernel_info request.
    ///
    /// Retries until the deadline; used after launch, when the kernel may
    /// not be listening yet.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<KernelInfoReply, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| Error::timeout(Channel::Shell, None))?;
            let attempt = remaining.min(Duration::from_secs(1));
            match self.kernel_info(attempt).await {
                Ok(reply) => {
                    if let Reply::Ok(info) = reply.content {
                        return Ok(info);
                    }
                    // An error reply still proves the kernel is up; retry.
                }
                Err(Error::Timeout { .. }) => {}
                Err(err) => return Err(err),
            }
        }
    }
}

fn deliver_reply(
    pending: &DashMap<String, oneshot::Sender<Message>>,
    diagnostics: &Diagnostics,
    message: Message,
    channel: Channel,
) {
    let Some(parent_id) = message.parent_msg_id().map(str::to_string) else {
        diagnostics.unknown_parents.fetch_add(1, Ordering::Relaxed);
        debug!("dropping {channel} message without a parent header");
        return;
    };
    match pending.remove(&parent_id) {
        Some((_, reply_tx)) => {
            let _ = reply_tx.send(message);
        }
        None => {
            diagnostics.unknown_parents.fetch_add(1, Ordering::Relaxed);
            debug!("dropping {channel} reply for unknown request {parent_id}");
        }
    }
}

fn broadcast_iopub(
    subscribers: &DashMap<u64, Subscriber>,
    diagnostics: &Diagnostics,
    message: Message,
) {
    let mut closed = Vec::new();
    for entry in subscribers.iter() {
        match entry.value().tx.force_send(message.clone()) {
            Ok(Some(_displaced)) => {
                entry.value().dropped.fetch_add(1, Ordering::Relaxed);
                diagnostics.iopub_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(_) => closed.push(*entry.key()),
        }
    }
    for id in closed {
        subscribers.remove(&id);
    }
}

async fn serve_stdin_channel(
    mut stdin: StdinChannel,
    session: Arc<Session>,
    requests_tx: async_channel::Sender<StdinRequest>,
    stdin_timeout: Duration,
    cancel: CancellationToken,
    diagnostics: Arc<Diagnostics>,
) {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = stdin.recv() => inbound,
        };
        let message = match inbound {
            Ok(message) => message,
            Err(err) => {
                if diagnostics.record_decode_error(&err, Channel::Stdin) {
                    continue;
                }
                warn!("stdin channel failed: {err}");
                break;
            }
        };
        let header = message.header.clone();
        let request = match message.into_typed::<InputRequest>() {
            Ok(typed) => typed.content,
            Err(err) => {
                warn!("unintelligible input_request: {err}");
                continue;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        // Displace a stale, already-expired request if one is still queued.
        let _ = requests_tx.force_send(StdinRequest {
            content: request,
            reply_tx,
        });

        let value = tokio::select! {
            _ = cancel.cancelled() => break,
            value = reply_rx => value.ok(),
            _ = tokio::time::sleep(stdin_timeout) => None,
        };
        let reply = match value {
            Some(value) => session
                .reply_message(
                    MessageType::InputReply,
                    crate::wire_protocol::InputReply { value },
                    &header,
                )
                .into_json(),
            None => {
                diagnostics.stdin_failures.fetch_add(1, Ordering::Relaxed);
                warn!("input_request went unanswered, telling the kernel");
                session
                    .reply_message(
                        MessageType::InputReply,
                        serde_json::json!({
                            "status": "error",
                            "ename": "StdinNotImplementedError",
                            "evalue": "input is not available",
                        }),
                        &header,
                    )
                    .into_json()
            }
        };
        if let Err(err) = stdin.send(&reply).await {
            warn!("error sending input_reply: {err}");
        }
    }
}

async fn run_heartbeat(
    mut heartbeat: HeartbeatChannel,
    beating_tx: watch::Sender<bool>,
    interval: Duration,
    stall_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let ping = heartbeat.ping(b"ping");
        tokio::pin!(ping);
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = &mut ping => break result,
                _ = tokio::time::sleep(stall_timeout) => {
                    // Keep waiting for the pong, but flag the stall.
                    let _ = beating_tx.send(false);
                }
            }
        };
        match result {
            Ok(_) => {
                let _ = beating_tx.send(true);
            }
            Err(err) => {
                debug!("heartbeat channel failed: {err}");
                let _ = beating_tx.send(false);
                return;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
