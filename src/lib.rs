//! A native client library for launching and talking to Jupyter kernels.
//!
//! This crate speaks the [Jupyter messaging protocol] over ZeroMQ. It can
//! start a kernel process from an installed kernel spec, connect to its five
//! messaging channels, sign and verify every message, and correlate
//! asynchronous requests with their replies. On top of that it layers an
//! interactive surface: execute code, inspect and complete, and wait until
//! the kernel is idle again.
//!
//! [Jupyter messaging protocol]: https://jupyter-client.readthedocs.io/en/stable/messaging.html
//!
//! The main entry points are:
//!
//! - [`kernelspec::KernelSpecResolver`] to discover installed kernels,
//! - [`manager::KernelManager`] to launch one and drive its lifecycle,
//! - [`client::KernelClient`] to exchange messages with it,
//! - [`multikernel::MultiKernelManager`] to own a named collection of them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::io;
use std::path::PathBuf;

use crate::channels::Channel;

pub mod channels;
pub mod client;
pub mod connection;
pub mod context;
pub mod kernelspec;
pub mod manager;
pub mod multikernel;
pub mod provisioning;
pub mod session;
pub mod wire_protocol;

fn timeout_message(channel: &Option<Channel>, request_id: &Option<String>) -> String {
    let mut msg = match channel {
        Some(channel) => format!("timed out waiting on the {channel} channel"),
        None => "operation timed out".into(),
    };
    if let Some(id) = request_id {
        msg += &format!(" for request {id}");
    }
    msg
}

/// Errors produced while provisioning kernels or exchanging messages.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A received message failed HMAC verification and was dropped.
    #[error("invalid signature on a {channel} message")]
    InvalidSignature {
        /// Channel the message arrived on.
        channel: Channel,
    },

    /// A received message repeated a signature seen earlier in the session.
    #[error("duplicate signature on a {channel} message")]
    DuplicateSignature {
        /// Channel the message arrived on.
        channel: Channel,
    },

    /// A received multipart payload did not follow the wire format.
    #[error("malformed frame on the {channel} channel: {reason}")]
    MalformedFrame {
        /// Channel the payload arrived on.
        channel: Channel,
        /// What was wrong with the payload.
        reason: String,
    },

    /// A blocking operation did not finish within its timeout.
    #[error("{}", timeout_message(.channel, .request_id))]
    Timeout {
        /// Channel the operation was waiting on, if any.
        channel: Option<Channel>,
        /// The request awaiting a reply, if any.
        request_id: Option<String>,
    },

    /// The surrounding operation was cancelled before it finished.
    #[error("operation cancelled")]
    Cancelled,

    /// The kernel process could not be started or never became ready.
    #[error("kernel failed to start: {0}")]
    StartFailed(String),

    /// The kernel process exited while requests were outstanding.
    #[error("kernel died unexpectedly")]
    KernelDied,

    /// A lifecycle operation was invoked while the kernel was not running.
    #[error("kernel is {0}, operation requires a running kernel")]
    NotRunning(String),

    /// No installed kernel spec matches the requested name.
    #[error("no kernel named {0:?}")]
    NoSuchKernel(String),

    /// No provisioner is registered under the requested name.
    #[error("no provisioner registered under {0:?}")]
    UnknownProvisioner(String),

    /// The channel was closed while an operation was in flight.
    #[error("the {0} channel is closed")]
    ChannelClosed(Channel),

    /// The connection file could not be created with owner-only access.
    #[error("permission denied for connection file {path:?}: {source}")]
    PermissionDenied {
        /// Path that could not be written.
        path: PathBuf,
        /// The underlying filesystem error.
        source: io::Error,
    },

    /// The kernel replied with a protocol version other than 5.x.
    #[error("kernel speaks protocol version {0:?}, expected 5.x")]
    ProtocolMismatch(String),

    /// A connection descriptor failed validation.
    #[error("invalid connection info: {0}")]
    InvalidConnectionInfo(String),

    /// A kernel spec on disk is unusable.
    #[error("invalid kernel spec: {0}")]
    InvalidKernelSpec(String),

    /// An error occurred while starting or managing a subprocess.
    #[error("failed to run subprocess: {0}")]
    Subprocess(#[source] io::Error),

    /// A filesystem or network I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Error originating from ZeroMQ.
    #[error("zeromq: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    /// Error while deserializing a message body.
    #[error("could not deserialize message: {0}")]
    DeserializeMessage(String),
}

impl Error {
    /// Construct a [`Error::Timeout`] scoped to a channel and request.
    pub fn timeout(channel: impl Into<Option<Channel>>, request_id: Option<String>) -> Self {
        Error::Timeout {
            channel: channel.into(),
            request_id,
        }
    }
}
