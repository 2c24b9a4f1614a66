//! Typed wrappers over the five kernel messaging sockets.
//!
//! Each channel has a fixed role and socket kind: shell, control, and
//! stdin are DEALER sockets speaking request/reply, iopub is a SUB socket
//! receiving broadcasts, and heartbeat is a REQ socket echoing opaque
//! bytes. All wrappers share one [`Session`] for signing and parsing.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use zeromq::{DealerSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::connection::ConnectionInfo;
use crate::session::Session;
use crate::wire_protocol::Message;
use crate::Error;

/// One of the five logical message channels.
#[derive(
    Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    /// Request/reply channel for execution and introspection.
    Shell,

    /// Higher-priority request/reply channel for interrupt and shutdown.
    Control,

    /// Broadcast channel for kernel status and output.
    Iopub,

    /// Channel for kernel-initiated input requests.
    Stdin,

    /// Opaque ping/pong channel for liveness checks.
    Heartbeat,
}

/// A messaging socket bound to one channel role.
pub struct ChannelSocket<S> {
    channel: Channel,
    socket: S,
    session: Arc<Session>,
}

/// The shell channel: client requests, one reply per request.
pub type ShellChannel = ChannelSocket<DealerSocket>;

/// The control channel: like shell, but separated to avoid queueing.
pub type ControlChannel = ChannelSocket<DealerSocket>;

/// The stdin channel: kernel-initiated input requests and their replies.
pub type StdinChannel = ChannelSocket<DealerSocket>;

/// The iopub channel: broadcasts from the kernel.
pub type IopubChannel = ChannelSocket<SubSocket>;

impl<S: Socket> ChannelSocket<S> {
    /// The role of this socket.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Close the channel, dropping the underlying socket.
    pub fn close(self) {
        drop(self.socket);
    }
}

impl<S: SocketSend> ChannelSocket<S> {
    /// Sign and send a message on this channel.
    pub async fn send(&mut self, message: &Message) -> Result<(), Error> {
        let frames = self.session.encode(message).into_multipart();
        let payload = ZmqMessage::try_from(frames).map_err(|err| Error::MalformedFrame {
            channel: self.channel,
            reason: err.to_string(),
        })?;
        self.socket.send(payload).await?;
        Ok(())
    }
}

impl<S: SocketRecv> ChannelSocket<S> {
    /// Receive, verify, and parse the next message on this channel.
    pub async fn recv(&mut self) -> Result<Message, Error> {
        let payload = self.socket.recv().await?;
        self.session.decode(payload.into_vec(), self.channel)
    }
}

/// Connect the shell channel of a kernel.
pub async fn connect_shell(
    info: &ConnectionInfo,
    session: Arc<Session>,
) -> Result<ShellChannel, Error> {
    let mut socket = DealerSocket::new();
    socket.connect(&info.shell_url()).await?;
    Ok(ChannelSocket {
        channel: Channel::Shell,
        socket,
        session,
    })
}

/// Connect the control channel of a kernel.
pub async fn connect_control(
    info: &ConnectionInfo,
    session: Arc<Session>,
) -> Result<ControlChannel, Error> {
    let mut socket = DealerSocket::new();
    socket.connect(&info.control_url()).await?;
    Ok(ChannelSocket {
        channel: Channel::Control,
        socket,
        session,
    })
}

/// Connect the stdin channel of a kernel.
pub async fn connect_stdin(
    info: &ConnectionInfo,
    session: Arc<Session>,
) -> Result<StdinChannel, Error> {
    let mut socket = DealerSocket::new();
    socket.connect(&info.stdin_url()).await?;
    Ok(ChannelSocket {
        channel: Channel::Stdin,
        socket,
        session,
    })
}

/// Connect and subscribe the iopub channel of a kernel.
pub async fn connect_iopub(
    info: &ConnectionInfo,
    session: Arc<Session>,
) -> Result<IopubChannel, Error> {
    let mut socket = SubSocket::new();
    socket.connect(&info.iopub_url()).await?;
    socket.subscribe("").await?;
    Ok(ChannelSocket {
        channel: Channel::Iopub,
        socket,
        session,
    })
}

/// The heartbeat channel: echoes arbitrary bytes to prove the kernel's
/// process is responsive, independently of the messaging channels.
pub struct HeartbeatChannel {
    socket: ReqSocket,
}

impl HeartbeatChannel {
    /// Connect the heartbeat channel of a kernel.
    pub async fn connect(info: &ConnectionInfo) -> Result<Self, Error> {
        let mut socket = ReqSocket::new();
        socket.connect(&info.hb_url()).await?;
        Ok(Self { socket })
    }

    /// Send a ping and wait for the kernel to echo it back.
    pub async fn ping(&mut self, payload: &[u8]) -> Result<Bytes, Error> {
        self.socket
            .send(ZmqMessage::from(payload.to_vec()))
            .await?;
        let pong = self.socket.recv().await?;
        Ok(pong.into_vec().into_iter().next().unwrap_or_default())
    }

    /// Close the channel, dropping the underlying socket.
    pub fn close(self) {
        drop(self.socket);
    }
}
