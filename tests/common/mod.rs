//! A fake in-process kernel for exercising the client and manager.
//!
//! The fake kernel binds the kernel side of all five sockets and speaks a
//! tiny command dialect on its shell channel (`print:`, `input:`, `spam:`,
//! `raise:`, `slow:`, `hang`, `tamper`, `twice`, `orphan`), which is
//! enough to drive every client behavior end to end without a real
//! language runtime.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use zeromq::{
    DealerSocket, PubSocket, RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage,
};

use burlap::channels::Channel;
use burlap::connection::ConnectionInfo;
use burlap::provisioning::{KernelProvisioner, LaunchCommand, LaunchContext, KernelSignal};
use burlap::session::Session;
use burlap::wire_protocol::{
    CompleteReply, CompleteRequest, ErrorReply, ExecuteInput, ExecuteReply, ExecuteRequest,
    InputReply, InputRequest, InterruptReply, KernelInfoReply, KernelStatus, LanguageInfo,
    Message, MessageType, Reply, ShutdownReply, ShutdownRequest, Status, Stream,
};
use burlap::Error;

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Write a minimal kernel spec directory under `root/kernels/<name>`.
pub async fn write_spec(root: &Path, name: &str) {
    let dir = root.join("kernels").join(name);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let spec = serde_json::json!({
        "argv": ["fake-kernel", "-f", "{connection_file}"],
        "display_name": name,
        "language": "fake",
    });
    tokio::fs::write(dir.join("kernel.json"), spec.to_string())
        .await
        .unwrap();
}

async fn bind_retry<S: Socket>(socket: &mut S, url: &str) {
    for _ in 0..40 {
        if socket.bind(url).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("could not bind {url}");
}

fn split_identities(frames: &[Bytes]) -> Vec<Bytes> {
    let delimiter = frames
        .iter()
        .position(|frame| frame.as_ref() == b"<IDS|MSG>")
        .expect("request has a delimiter");
    frames[..delimiter].to_vec()
}

async fn send_with_identities(
    socket: &mut (impl SocketSend + Send),
    session: &Session,
    identities: Vec<Bytes>,
    message: &Message,
) {
    let mut frame = session.encode(message);
    frame.identities = identities;
    let payload = ZmqMessage::try_from(frame.into_multipart()).unwrap();
    socket.send(payload).await.ok();
}

/// Handle controlling one spawned fake kernel.
#[derive(Clone)]
pub struct FakeKernelHandle {
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
}

impl FakeKernelHandle {
    /// Simulate a crash: stop serving and report the process as exited.
    pub fn stop(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Whether the fake kernel's "process" has exited.
    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Bind the kernel side of a connection and serve the fake dialect.
pub async fn spawn_fake_kernel(info: &ConnectionInfo) -> FakeKernelHandle {
    let session = Arc::new(Session::new(&info.key).with_username("kernel"));
    let cancel = CancellationToken::new();
    let exited = Arc::new(AtomicBool::new(false));

    let mut shell = RouterSocket::new();
    bind_retry(&mut shell, &info.shell_url()).await;
    let mut control = RouterSocket::new();
    bind_retry(&mut control, &info.control_url()).await;
    let mut iopub = PubSocket::new();
    bind_retry(&mut iopub, &info.iopub_url()).await;
    // A real kernel binds a ROUTER here and routes by the shell identity;
    // with a single client a DEALER pair behaves identically.
    let mut stdin = DealerSocket::new();
    bind_retry(&mut stdin, &info.stdin_url()).await;
    let mut heartbeat = RepSocket::new();
    bind_retry(&mut heartbeat, &info.hb_url()).await;

    let handle = FakeKernelHandle {
        cancel: cancel.clone(),
        exited: exited.clone(),
    };

    // Heartbeat: echo whatever arrives.
    let hb_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let ping = tokio::select! {
                _ = hb_cancel.cancelled() => break,
                ping = heartbeat.recv() => ping,
            };
            match ping {
                Ok(payload) => {
                    if heartbeat.send(payload).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Control: shutdown and interrupt requests.
    let control_session = session.clone();
    let control_cancel = cancel.clone();
    let control_exited = exited.clone();
    tokio::spawn(async move {
        loop {
            let inbound = tokio::select! {
                _ = control_cancel.cancelled() => break,
                inbound = control.recv() => inbound,
            };
            let Ok(payload) = inbound else { break };
            let frames = payload.into_vec();
            let identities = split_identities(&frames);
            let Ok(request) = control_session.decode(frames, Channel::Control) else {
                continue;
            };
            match request.header.msg_type {
                MessageType::ShutdownRequest => {
                    let restart = request
                        .clone()
                        .into_typed::<ShutdownRequest>()
                        .map(|typed| typed.content.restart)
                        .unwrap_or(false);
                    let reply = control_session
                        .reply_message(
                            MessageType::ShutdownReply,
                            Reply::Ok(ShutdownReply { restart }),
                            &request.header,
                        )
                        .into_json();
                    send_with_identities(&mut control, &control_session, identities, &reply)
                        .await;
                    // Let the reply flush before the sockets go away.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    control_exited.store(true, Ordering::SeqCst);
                    control_cancel.cancel();
                    break;
                }
                MessageType::InterruptRequest => {
                    let reply = control_session
                        .reply_message(
                            MessageType::InterruptReply,
                            Reply::Ok(InterruptReply {}),
                            &request.header,
                        )
                        .into_json();
                    send_with_identities(&mut control, &control_session, identities, &reply)
                        .await;
                }
                _ => {}
            }
        }
    });

    // Shell: the command dialect.
    let shell_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut server = ShellServer {
            shell,
            iopub,
            stdin,
            session,
            execution_count: 0,
        };
        loop {
            let inbound = tokio::select! {
                _ = shell_cancel.cancelled() => break,
                inbound = server.shell.recv() => inbound,
            };
            let Ok(payload) = inbound else { break };
            server.handle(payload).await;
        }
    });

    handle
}

struct ShellServer {
    shell: RouterSocket,
    iopub: PubSocket,
    stdin: DealerSocket,
    session: Arc<Session>,
    execution_count: i32,
}

impl ShellServer {
    async fn publish<T: serde::Serialize>(
        &mut self,
        msg_type: MessageType,
        content: T,
        parent: &burlap::wire_protocol::Header,
    ) {
        let topic = vec![Bytes::from(format!("{:?}", msg_type).to_lowercase())];
        let message = self
            .session
            .reply_message(msg_type, content, parent)
            .into_json();
        let session = self.session.clone();
        send_with_identities(&mut self.iopub, &session, topic, &message).await;
    }

    async fn status(&mut self, state: KernelStatus, parent: &burlap::wire_protocol::Header) {
        self.publish(
            MessageType::Status,
            Status {
                execution_state: state,
            },
            parent,
        )
        .await;
    }

    async fn reply(&mut self, identities: Vec<Bytes>, message: &Message) {
        let session = self.session.clone();
        send_with_identities(&mut self.shell, &session, identities, message).await;
    }

    async fn handle(&mut self, payload: ZmqMessage) {
        let frames = payload.into_vec();
        let identities = split_identities(&frames);
        let Ok(request) = self.session.decode(frames, Channel::Shell) else {
            return;
        };

        match request.header.msg_type {
            MessageType::KernelInfoRequest => {
                self.status(KernelStatus::Busy, &request.header).await;
                let reply = self
                    .session
                    .reply_message(
                        MessageType::KernelInfoReply,
                        Reply::Ok(KernelInfoReply {
                            protocol_version: "5.3".into(),
                            implementation: "fake-kernel".into(),
                            implementation_version: "0.1.0".into(),
                            language_info: LanguageInfo {
                                name: "fake".into(),
                                version: "0.1".into(),
                                mimetype: "text/x-fake".into(),
                                file_extension: ".fake".into(),
                                nbconvert_exporter: "script".into(),
                            },
                            banner: "fake kernel for tests".into(),
                            debugger: false,
                            help_links: vec![],
                        }),
                        &request.header,
                    )
                    .into_json();
                self.reply(identities, &reply).await;
                self.status(KernelStatus::Idle, &request.header).await;
            }
            MessageType::ExecuteRequest => {
                self.handle_execute(identities, request).await;
            }
            MessageType::CompleteRequest => {
                self.status(KernelStatus::Busy, &request.header).await;
                let code = request
                    .clone()
                    .into_typed::<CompleteRequest>()
                    .map(|typed| typed.content.code)
                    .unwrap_or_default();
                let reply = self
                    .session
                    .reply_message(
                        MessageType::CompleteReply,
                        Reply::Ok(CompleteReply {
                            matches: vec![format!("{code}_alpha"), format!("{code}_beta")],
                            cursor_start: 0,
                            cursor_end: code.len() as u32,
                            metadata: Default::default(),
                        }),
                        &request.header,
                    )
                    .into_json();
                self.reply(identities, &reply).await;
                self.status(KernelStatus::Idle, &request.header).await;
            }
            _ => {}
        }
    }

    async fn handle_execute(&mut self, identities: Vec<Bytes>, request: Message) {
        let parent = request.header.clone();
        let Ok(typed) = request.into_typed::<ExecuteRequest>() else {
            return;
        };
        let code = typed.content.code.trim().to_string();
        self.execution_count += 1;
        let execution_count = self.execution_count;

        self.status(KernelStatus::Busy, &parent).await;
        self.publish(
            MessageType::ExecuteInput,
            ExecuteInput {
                code: code.clone(),
                execution_count,
            },
            &parent,
        )
        .await;

        let ok_reply = self
            .session
            .reply_message(
                MessageType::ExecuteReply,
                Reply::Ok(ExecuteReply {
                    execution_count,
                    user_expressions: None,
                }),
                &parent,
            )
            .into_json();

        if let Some(text) = code.strip_prefix("print:") {
            self.stream(text, &parent).await;
            self.reply(identities, &ok_reply).await;
        } else if let Some(prompt) = code.strip_prefix("input:") {
            let value = self.request_input(prompt, &parent).await;
            self.stream(&value, &parent).await;
            self.reply(identities, &ok_reply).await;
        } else if let Some(count) = code.strip_prefix("spam:") {
            let count: usize = count.parse().unwrap_or(0);
            for i in 0..count {
                self.stream(&format!("line {i}"), &parent).await;
            }
            self.reply(identities, &ok_reply).await;
        } else if let Some(ename) = code.strip_prefix("raise:") {
            let error = ErrorReply {
                ename: ename.to_string(),
                evalue: format!("{ename} was raised"),
                traceback: vec![format!("Traceback: {ename}")],
            };
            self.publish(MessageType::Error, error.clone(), &parent).await;
            let reply = self
                .session
                .reply_message(MessageType::ExecuteReply, Reply::<ExecuteReply>::Error(error), &parent)
                .into_json();
            self.reply(identities, &reply).await;
        } else if let Some(millis) = code.strip_prefix("slow:") {
            let millis: u64 = millis.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            self.reply(identities, &ok_reply).await;
        } else if code == "hang" {
            // Swallow the request: no reply, no idle.
            return;
        } else if code == "tamper" {
            let mut frame = self.session.encode(&ok_reply);
            let mut content = frame.parts[3].to_vec();
            content[0] ^= 0x20;
            frame.parts[3] = content.into();
            frame.identities = identities;
            let payload = ZmqMessage::try_from(frame.into_multipart()).unwrap();
            self.shell.send(payload).await.ok();
        } else if code == "twice" {
            let mut frame = self.session.encode(&ok_reply);
            frame.identities = identities;
            let payload = ZmqMessage::try_from(frame.into_multipart()).unwrap();
            self.shell.send(payload.clone()).await.ok();
            self.shell.send(payload).await.ok();
        } else if code == "orphan" {
            // A reply to a request nobody made, then the real one.
            let ghost = self.session.message(MessageType::KernelInfoRequest, ()).header;
            let bogus = self
                .session
                .reply_message(
                    MessageType::ExecuteReply,
                    Reply::Ok(ExecuteReply {
                        execution_count,
                        user_expressions: None,
                    }),
                    &ghost,
                )
                .into_json();
            self.reply(identities.clone(), &bogus).await;
            self.reply(identities, &ok_reply).await;
        } else {
            self.reply(identities, &ok_reply).await;
        }

        self.status(KernelStatus::Idle, &parent).await;
    }

    async fn stream(&mut self, text: &str, parent: &burlap::wire_protocol::Header) {
        self.publish(
            MessageType::Stream,
            Stream {
                name: "stdout".into(),
                text: format!("{text}\n"),
            },
            parent,
        )
        .await;
    }

    async fn request_input(&mut self, prompt: &str, parent: &burlap::wire_protocol::Header) -> String {
        let request = self
            .session
            .reply_message(
                MessageType::InputRequest,
                InputRequest {
                    prompt: prompt.to_string(),
                    password: false,
                },
                parent,
            )
            .into_json();
        let session = self.session.clone();
        send_with_identities(&mut self.stdin, &session, vec![], &request).await;

        let reply = tokio::time::timeout(Duration::from_secs(5), self.stdin.recv()).await;
        let Ok(Ok(payload)) = reply else {
            return String::new();
        };
        match self.session.decode(payload.into_vec(), Channel::Stdin) {
            Ok(message) => message
                .into_typed::<InputReply>()
                .map(|typed| typed.content.value)
                .unwrap_or_default(),
            Err(_) => String::new(),
        }
    }
}

/// Shared control surface between a test and its mock provisioners.
///
/// Each provisioner instance owns its kernel handle; the control only
/// counts launches and lets the test crash the most recent kernel.
#[derive(Default)]
pub struct MockKernelControl {
    launches: AtomicU32,
    handles: Mutex<Vec<FakeKernelHandle>>,
}

impl MockKernelControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How many times a kernel has been launched through this control.
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Simulate the most recently launched kernel's process crashing.
    pub fn crash(&self) {
        if let Some(handle) = self.handles.lock().unwrap().last() {
            handle.stop();
        }
    }

    fn record(&self, handle: FakeKernelHandle) {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().push(handle);
    }
}

/// A provisioner that "launches" an in-process fake kernel.
pub struct MockProvisioner {
    control: Arc<MockKernelControl>,
    handle: Option<FakeKernelHandle>,
    connection: Option<ConnectionInfo>,
}

impl MockProvisioner {
    pub fn new(control: Arc<MockKernelControl>) -> Self {
        Self {
            control,
            handle: None,
            connection: None,
        }
    }
}

#[async_trait]
impl KernelProvisioner for MockProvisioner {
    fn has_process(&self) -> bool {
        self.handle.is_some()
    }

    async fn pre_launch(&mut self, context: &LaunchContext) -> Result<LaunchCommand, Error> {
        Ok(LaunchCommand {
            argv: context.spec.argv.clone(),
            env: context.spec.env.clone(),
        })
    }

    async fn launch(
        &mut self,
        _command: LaunchCommand,
        _context: &LaunchContext,
    ) -> Result<(), Error> {
        let info = self
            .connection
            .as_ref()
            .ok_or_else(|| Error::StartFailed("no connection info loaded".into()))?;
        if let Some(previous) = self.handle.take() {
            previous.stop();
        }
        let handle = spawn_fake_kernel(info).await;
        self.control.record(handle.clone());
        self.handle = Some(handle);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<i32>, Error> {
        match &self.handle {
            Some(handle) if !handle.exited() => Ok(None),
            _ => Ok(Some(0)),
        }
    }

    async fn wait(&mut self, timeout: Duration) -> Result<i32, Error> {
        let handle = self.handle.clone();
        let exited = wait_until(timeout, || {
            handle.as_ref().map(|handle| handle.exited()).unwrap_or(true)
        })
        .await;
        if exited {
            Ok(0)
        } else {
            Err(Error::timeout(None, None))
        }
    }

    async fn send_signal(&mut self, signal: KernelSignal) -> Result<(), Error> {
        match signal {
            KernelSignal::Interrupt => Ok(()),
            KernelSignal::Terminate | KernelSignal::Kill => {
                if let Some(handle) = &self.handle {
                    handle.stop();
                }
                Ok(())
            }
        }
    }

    async fn kill(&mut self) -> Result<(), Error> {
        if let Some(handle) = &self.handle {
            handle.stop();
        }
        Ok(())
    }

    async fn cleanup(&mut self, _restart: bool) -> Result<(), Error> {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
        Ok(())
    }

    fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.connection.as_ref()
    }

    fn load_connection_info(&mut self, info: &ConnectionInfo) {
        self.connection = Some(info.clone());
    }
}
