//! The session layer: message minting, framing, signing, and verification.
//!
//! A [`Session`] scopes message and signature identifiers. It builds
//! outbound [`Message`]s with fresh ids, serializes them into the
//! multipart wire format, and parses inbound multipart payloads back into
//! verified messages. Every signed part is authenticated with
//! HMAC-SHA256 over the four JSON parts, hex-encoded in lowercase.

use std::collections::{HashSet, VecDeque};
use std::env;
use std::sync::Mutex;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::channels::Channel;
use crate::wire_protocol::{Header, Message, MessageType, Timestamp, PROTOCOL_VERSION};
use crate::Error;

/// The literal frame separating routing prefixes from the signed payload.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// How many recently seen signatures are retained for replay detection.
pub const DIGEST_HISTORY_SIZE: usize = 1 << 16;

type HmacSha256 = Hmac<Sha256>;

/// A message as it appears on the wire: routing prefixes, a signature, the
/// four signed JSON parts, and any trailing opaque buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireFrame {
    /// Routing prefixes (socket identities, or the iopub topic).
    pub identities: Vec<Bytes>,

    /// Lowercase hex HMAC over the four parts; empty when signing is off.
    pub signature: String,

    /// Exactly four JSON parts: header, parent header, metadata, content.
    pub parts: Vec<Bytes>,

    /// Opaque binary buffers, excluded from the signature.
    pub buffers: Vec<Bytes>,
}

impl WireFrame {
    /// Flatten the frame into the ordered byte strings sent on a socket.
    pub fn into_multipart(self) -> Vec<Bytes> {
        let mut frames = self.identities;
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::from(self.signature));
        frames.extend(self.parts);
        frames.extend(self.buffers);
        frames
    }
}

/// Bounded FIFO of signatures already seen on the shell channel.
#[derive(Default)]
struct DigestHistory {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DigestHistory {
    /// Record a signature, returning false if it was already present.
    fn observe(&mut self, signature: &str) -> bool {
        if !self.seen.insert(signature.to_string()) {
            return false;
        }
        self.order.push_back(signature.to_string());
        if self.order.len() > DIGEST_HISTORY_SIZE {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// The scope within which message and signature identifiers are unique.
///
/// A session holds the signing key, mints message ids, and remembers
/// recently seen shell signatures so replayed frames are rejected. With an
/// empty key, messages carry an empty signature and verification is
/// skipped entirely; this is an explicit opt-out for same-host trusted
/// setups and is insecure anywhere else.
pub struct Session {
    id: String,
    username: String,
    key: Vec<u8>,
    digest_history: Mutex<DigestHistory>,
}

impl Session {
    /// Create a session with a fresh id and the given signing key.
    pub fn new(key: &str) -> Self {
        let username = env::var("USER")
            .or_else(|_| env::var("USERNAME"))
            .unwrap_or_else(|_| "kernel".into());
        Self {
            id: Uuid::new_v4().to_string(),
            username,
            key: key.as_bytes().to_vec(),
            digest_history: Mutex::new(DigestHistory::default()),
        }
    }

    /// Override the username stamped on outbound headers.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// The unique id of this session.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The username stamped on outbound headers.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether messages are signed and verified.
    pub fn signing_enabled(&self) -> bool {
        !self.key.is_empty()
    }

    /// Build an outbound message with a fresh id and current timestamp.
    pub fn message<T>(&self, msg_type: MessageType, content: T) -> Message<T> {
        Message {
            header: Header {
                msg_id: Uuid::new_v4().to_string(),
                session: self.id.clone(),
                username: self.username.clone(),
                date: Timestamp::now(),
                msg_type,
                version: PROTOCOL_VERSION.into(),
            },
            parent_header: None,
            metadata: serde_json::Map::new(),
            content,
            buffers: Vec::new(),
        }
    }

    /// Build a reply to a message previously received from the kernel.
    pub fn reply_message<T>(&self, msg_type: MessageType, content: T, parent: &Header) -> Message<T> {
        self.message(msg_type, content).with_parent(parent)
    }

    /// Compute the signature over the signed parts of a frame.
    pub fn sign(&self, parts: &[Bytes]) -> String {
        if self.key.is_empty() {
            return String::new();
        }
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any size");
        for part in parts {
            mac.update(part);
        }
        hex::encode(mac.finalize().into_bytes())
    }

    /// Serialize and sign a message for transport.
    pub fn encode(&self, message: &Message) -> WireFrame {
        let header = Bytes::from(
            serde_json::to_vec(&message.header).expect("message JSON serialization"),
        );
        let parent_header = match &message.parent_header {
            Some(parent) => {
                Bytes::from(serde_json::to_vec(parent).expect("message JSON serialization"))
            }
            None => Bytes::from_static(b"{}"),
        };
        let metadata = Bytes::from(
            serde_json::to_vec(&message.metadata).expect("message JSON serialization"),
        );
        let content = Bytes::from(
            serde_json::to_vec(&message.content).expect("message JSON serialization"),
        );

        let parts = vec![header, parent_header, metadata, content];
        let signature = self.sign(&parts);
        WireFrame {
            identities: Vec::new(),
            signature,
            parts,
            buffers: message.buffers.clone(),
        }
    }

    /// Split a multipart payload into a structured frame, without
    /// verifying it.
    pub fn split_frames(frames: Vec<Bytes>, channel: Channel) -> Result<WireFrame, Error> {
        let malformed = |reason: &str| Error::MalformedFrame {
            channel,
            reason: reason.into(),
        };

        let delimiter_index = frames
            .iter()
            .position(|frame| frame.as_ref() == DELIMITER)
            .ok_or_else(|| malformed("missing <IDS|MSG> delimiter"))?;
        let identities = frames[..delimiter_index].to_vec();
        let rest = &frames[delimiter_index + 1..];
        if rest.len() < 5 {
            return Err(malformed("expected a signature and four message parts"));
        }
        let signature = String::from_utf8(rest[0].to_vec())
            .map_err(|_| malformed("signature is not valid UTF-8"))?;

        Ok(WireFrame {
            identities,
            signature,
            parts: rest[1..5].to_vec(),
            buffers: rest[5..].to_vec(),
        })
    }

    /// Parse a multipart payload into a verified message.
    ///
    /// With a key set, the signature is recomputed and compared in constant
    /// time; mismatches fail with [`Error::InvalidSignature`]. Shell frames
    /// repeating a previously seen signature fail with
    /// [`Error::DuplicateSignature`]. Iopub is a broadcast channel, so it
    /// is exempt from replay detection.
    pub fn decode(&self, frames: Vec<Bytes>, channel: Channel) -> Result<Message, Error> {
        let frame = Self::split_frames(frames, channel)?;

        if !self.key.is_empty() {
            let expected = hex::decode(&frame.signature)
                .map_err(|_| Error::InvalidSignature { channel })?;
            let mut mac =
                HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any size");
            for part in &frame.parts {
                mac.update(part);
            }
            mac.verify_slice(&expected)
                .map_err(|_| Error::InvalidSignature { channel })?;

            if channel == Channel::Shell {
                let mut history = self.digest_history.lock().expect("digest history lock");
                if !history.observe(&frame.signature) {
                    return Err(Error::DuplicateSignature { channel });
                }
            }
        }

        let malformed = |reason: String| Error::MalformedFrame { channel, reason };

        let header: Header = serde_json::from_slice(&frame.parts[0])
            .map_err(|err| malformed(format!("invalid header: {err}")))?;
        // An empty object (or anything unintelligible) means no parent.
        let parent_header: Option<Header> = serde_json::from_slice(&frame.parts[1]).ok();
        let metadata = serde_json::from_slice(&frame.parts[2])
            .map_err(|err| malformed(format!("invalid metadata: {err}")))?;
        let content = serde_json::from_slice(&frame.parts[3])
            .map_err(|err| malformed(format!("invalid content: {err}")))?;

        Ok(Message {
            header,
            parent_header,
            metadata,
            content,
            buffers: frame.buffers,
        })
    }
}
