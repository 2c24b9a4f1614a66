//! Jupyter kernel wire protocol message types.
//!
//! See the [Messaging in Jupyter](https://jupyter-client.readthedocs.io/en/stable/messaging.html)
//! page for documentation about how this works. Every message is a
//! {header, parent_header, metadata, content, buffers} tuple; the content
//! schema depends on the message type, so messages are carried as untyped
//! JSON and converted at the edges with [`Message::into_typed`].

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::format_description::well_known::Iso8601;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::Error;

/// Protocol version stamped on every outbound header. Any 5.x peer is
/// accepted.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Type of a kernel wire protocol message, either request or reply.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum MessageType {
    /// Execute a block of code.
    ExecuteRequest,

    /// Return execution results.
    ExecuteReply,

    /// Request detailed information about a piece of code.
    InspectRequest,

    /// Return detailed information about the inspected code.
    InspectReply,

    /// Request code completions or suggestions.
    CompleteRequest,

    /// Return completions or suggestions for the code.
    CompleteReply,

    /// Request execution history (not often used).
    HistoryRequest,

    /// Return the requested execution history (not often used).
    HistoryReply,

    /// Request to check if code is complete.
    IsCompleteRequest,

    /// Reply indicating if code is complete.
    IsCompleteReply,

    /// Request information about existing comms.
    CommInfoRequest,

    /// Reply with information about existing comms.
    CommInfoReply,

    /// Request kernel information.
    KernelInfoRequest,

    /// Reply with kernel information.
    KernelInfoReply,

    /// Request kernel shutdown.
    ShutdownRequest,

    /// Reply to confirm kernel shutdown.
    ShutdownReply,

    /// Request to interrupt kernel execution.
    InterruptRequest,

    /// Reply to confirm kernel interruption.
    InterruptReply,

    /// Request to start or stop a debugger.
    DebugRequest,

    /// Reply with debugger status.
    DebugReply,

    /// Request from the kernel for a line of user input.
    InputRequest,

    /// Reply to the kernel with the requested input.
    InputReply,

    /// Streams of output (stdout, stderr) from the kernel.
    Stream,

    /// Bring back data to be displayed in frontends.
    DisplayData,

    /// Update display data with new information.
    UpdateDisplayData,

    /// Re-broadcast of code in ExecuteRequest.
    ExecuteInput,

    /// Results of a code execution.
    ExecuteResult,

    /// When an error occurs during code execution.
    Error,

    /// Updates about kernel status.
    Status,

    /// Clear output visible on the frontend.
    ClearOutput,

    /// For debugging kernels to send events.
    DebugEvent,

    /// Another kernel message type that is unrecognized.
    #[serde(untagged)]
    Other(String),
}

const DATE_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

/// A message timestamp that tolerates peers with sloppy clocks.
///
/// Outbound timestamps are UTC with microsecond precision and a trailing
/// "Z". Inbound `date` strings that fail ISO 8601 parsing are carried
/// through verbatim rather than failing the whole message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Timestamp {
    /// A parsed UTC instant.
    Utc(OffsetDateTime),

    /// A date string the parser did not understand, passed through as-is.
    Raw(String),
}

impl Timestamp {
    /// The current instant, truncated to microsecond precision.
    pub fn now() -> Self {
        let now = OffsetDateTime::now_utc();
        let now = now
            .replace_nanosecond(now.nanosecond() / 1_000 * 1_000)
            .unwrap_or(now);
        Timestamp::Utc(now)
    }

    /// The parsed instant, if the timestamp was parseable.
    pub fn instant(&self) -> Option<OffsetDateTime> {
        match self {
            Timestamp::Utc(instant) => Some(*instant),
            Timestamp::Raw(_) => None,
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Timestamp::Utc(instant) => {
                let formatted = instant
                    .to_offset(UtcOffset::UTC)
                    .format(&DATE_FORMAT)
                    .map_err(serde::ser::Error::custom)?;
                serializer.serialize_str(&formatted)
            }
            Timestamp::Raw(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match OffsetDateTime::parse(&s, &Iso8601::DEFAULT) {
            Ok(instant) => Timestamp::Utc(instant),
            Err(_) => Timestamp::Raw(s),
        })
    }
}

/// Header of a message, generally part of the {header, parent_header,
/// metadata, content, buffers} 5-tuple.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Typically UUID, must be unique per message.
    pub msg_id: String,

    /// Typically UUID, should be unique per session.
    pub session: String,

    /// The username of the user sending the message.
    pub username: String,

    /// ISO 8601 timestamp for when the message is created.
    pub date: Timestamp,

    /// The message type.
    pub msg_type: MessageType,

    /// Message protocol version.
    pub version: String,
}

/// A message sent to or received from a Jupyter kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<T = serde_json::Value> {
    /// The message header.
    pub header: Header,

    /// The parent message header, if any.
    pub parent_header: Option<Header>,

    /// Arbitrary metadata attached to the message.
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// The content of the message.
    pub content: T,

    /// Buffers for large data, if any (used by extensions).
    pub buffers: Vec<Bytes>,
}

impl<T> Message<T> {
    /// Attach the header of the originating request.
    pub fn with_parent(mut self, parent: &Header) -> Self {
        self.parent_header = Some(parent.clone());
        self
    }

    /// Attach opaque binary buffers to the message.
    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }

    /// The message id of the originating request, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|header| &*header.msg_id)
    }
}

impl<T: Serialize> Message<T> {
    /// Produce a variant of the message with JSON-serialized content.
    pub fn into_json(self) -> Message {
        Message {
            header: self.header,
            parent_header: self.parent_header,
            metadata: self.metadata,
            content: serde_json::to_value(&self.content).expect("message JSON serialization"),
            buffers: self.buffers,
        }
    }
}

impl Message {
    /// Deserialize the content of the message into a specific type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<Message<T>, Error> {
        Ok(Message {
            header: self.header,
            parent_header: self.parent_header,
            metadata: self.metadata,
            content: serde_json::from_value(self.content)
                .map_err(|err| Error::DeserializeMessage(err.to_string()))?,
            buffers: self.buffers,
        })
    }
}

/// The content of a reply to a kernel request, with status attached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply<T> {
    /// The request was processed successfully.
    Ok(T),

    /// The request failed due to an error.
    Error(ErrorReply),

    /// This is the same as `status="error"` but with no information about
    /// the error. No fields should be present other than status.
    ///
    /// Some messages like execute_reply return "aborted" instead, see
    /// <https://github.com/ipython/ipykernel/issues/367> for details.
    #[serde(alias = "aborted")]
    Abort,
}

/// Content of an error response message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorReply {
    /// The error name, such as 'NameError'.
    pub ename: String,

    /// The error message, such as 'NameError: name 'x' is not defined'.
    pub evalue: String,

    /// The traceback frames of the error as a list of strings.
    pub traceback: Vec<String>,
}

/// Execute code on behalf of the user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// Source code to be executed by the kernel, one or more lines.
    pub code: String,

    /// A boolean flag which, if true, signals the kernel to execute the
    /// code as quietly as possible.
    pub silent: bool,

    /// A boolean flag which, if true, signals the kernel to populate the
    /// history.
    pub store_history: bool,

    /// A dictionary mapping names to expressions to be evaluated in the
    /// user's dictionary. The rich display-data representation of each will
    /// be evaluated after execution.
    pub user_expressions: BTreeMap<String, String>,

    /// If true, code running in the kernel can prompt the user for input
    /// with an `input_request` message.
    pub allow_stdin: bool,

    /// A boolean flag, which, if true, aborts the execution queue if an
    /// exception is encountered. If false, queued `execute_requests` will
    /// execute even if this request generates an exception.
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    /// An execute request with the usual interactive defaults.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: BTreeMap::new(),
            allow_stdin: true,
            stop_on_error: true,
        }
    }
}

/// Represents a reply to an execute request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteReply {
    /// The execution count, which increments with each request that stores
    /// history.
    pub execution_count: i32,

    /// Results for the user expressions evaluated during execution. Only
    /// present when status is 'ok'.
    pub user_expressions: Option<BTreeMap<String, String>>,
}

/// Request for introspection of code to retrieve useful information as
/// determined by the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InspectRequest {
    /// The code context in which introspection is requested, potentially
    /// multiple lines.
    pub code: String,

    /// The cursor position within 'code' where introspection is requested,
    /// in Unicode characters.
    pub cursor_pos: u32,

    /// The level of detail desired, where 0 might be basic info (`x?` in
    /// IPython) and 1 includes more detail (`x??` in IPython).
    pub detail_level: u8,
}

/// Represents a reply to an inspect request with potentially formatted
/// information about the code context.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InspectReply {
    /// Indicates whether an object was found during the inspection.
    pub found: bool,

    /// A dictionary containing the data representing the inspected object,
    /// can be empty if nothing is found.
    pub data: BTreeMap<String, serde_json::Value>,

    /// Metadata associated with the data, can also be empty.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Request for code completion based on the context provided in the code
/// and cursor position.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompleteRequest {
    /// The code context in which completion is requested, possibly a
    /// multiline string.
    pub code: String,

    /// The cursor position within 'code' in Unicode characters where
    /// completion is requested.
    pub cursor_pos: u32,
}

/// Represents a reply to a completion request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompleteReply {
    /// A list of all matches to the completion request.
    pub matches: Vec<String>,

    /// The starting position of the text that should be replaced by the
    /// completion.
    pub cursor_start: u32,

    /// The ending position of the text that should be replaced by the
    /// completion.
    pub cursor_end: u32,

    /// Metadata providing additional information about completions.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Request to determine if the provided code is complete and ready for
/// execution.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IsCompleteRequest {
    /// The code entered so far, possibly spanning multiple lines.
    pub code: String,
}

/// Represents a reply to an is_complete request, indicating the
/// completeness status of the code.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IsCompleteReply {
    /// The status of the code's completeness: 'complete', 'incomplete',
    /// 'invalid', or 'unknown'.
    pub status: String,

    /// Suggested characters to indent the next line if the code is
    /// incomplete.
    #[serde(default)]
    pub indent: Option<String>,
}

/// Request for the kernel's execution history.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HistoryRequest {
    /// If true, include the output of executions in the history.
    pub output: bool,

    /// If true, return the raw input as typed, not the transformed input.
    pub raw: bool,

    /// How history should be accessed: 'range', 'tail', or 'search'.
    pub hist_access_type: String,

    /// For 'range' access, the session to fetch from (0 is the current
    /// session, negative numbers count back).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<i64>,

    /// For 'range' access, the first execution count to include.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,

    /// For 'range' access, the last execution count to include.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,

    /// For 'tail' and 'search' access, how many entries to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,

    /// For 'search' access, a glob pattern over the input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// For 'search' access, drop duplicate entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
}

impl HistoryRequest {
    /// A request for the last `n` inputs of the current session.
    pub fn tail(n: i64) -> Self {
        Self {
            output: false,
            raw: true,
            hist_access_type: "tail".into(),
            session: None,
            start: None,
            stop: None,
            n: Some(n),
            pattern: None,
            unique: None,
        }
    }
}

/// Represents a reply to a history request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HistoryReply {
    /// History entries, each a (session, line_number, input_or_io) triple.
    pub history: Vec<serde_json::Value>,
}

/// Request information about comms currently open on the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct CommInfoRequest {
    /// Restrict the reply to comms with this target name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

/// Represents a reply to a comm_info request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommInfoReply {
    /// Mapping from comm id to a dictionary with its target name.
    pub comms: BTreeMap<String, serde_json::Value>,
}

/// Request for information about the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct KernelInfoRequest {}

/// Represents a reply to a kernel_info request, providing details about the
/// kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KernelInfoReply {
    /// Version of the messaging protocol used by the kernel.
    pub protocol_version: String,

    /// The name of the kernel implementation (e.g., 'ipython').
    pub implementation: String,

    /// The version number of the kernel's implementation.
    pub implementation_version: String,

    /// Detailed information about the programming language used by the
    /// kernel.
    pub language_info: LanguageInfo,

    /// A banner of information about the kernel, displayed in console.
    pub banner: String,

    /// Indicates if the kernel supports debugging.
    #[serde(default)]
    pub debugger: bool,

    /// Optional list of help links for the kernel's language.
    #[serde(default)]
    pub help_links: Vec<HelpLink>,
}

/// Detailed information about the programming language of the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LanguageInfo {
    /// Name of the programming language.
    pub name: String,

    /// Version number of the language.
    pub version: String,

    /// MIME type for script files in this language.
    pub mimetype: String,

    /// File extension for script files in this language.
    pub file_extension: String,

    /// Nbconvert exporter, if notebooks should be exported differently than
    /// the general script.
    #[serde(default)]
    pub nbconvert_exporter: String,
}

/// A single entry in a kernel's help links.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HelpLink {
    /// Text to display for the link.
    pub text: String,

    /// Target URL of the link.
    pub url: String,
}

/// Request to shut down the kernel, possibly to prepare for a restart.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// Indicates whether the shutdown is final or precedes a restart.
    pub restart: bool,
}

/// Represents a reply to a shutdown request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReply {
    /// Matches the restart flag from the request to indicate the intended
    /// shutdown behavior.
    pub restart: bool,
}

/// Request to interrupt the kernel's current operation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct InterruptRequest {}

/// Represents a reply to an interrupt request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InterruptReply {}

/// Request from the kernel for a line of input from the user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InputRequest {
    /// Prompt to display to the user.
    pub prompt: String,

    /// If true, the input should not be echoed (e.g. a password).
    #[serde(default)]
    pub password: bool,
}

/// Reply to the kernel with a line of input from the user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InputReply {
    /// The input value provided by the user.
    pub value: String,
}

/// Streams of output from the kernel, such as stdout and stderr.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    /// The name of the stream, one of 'stdout' or 'stderr'.
    pub name: String,

    /// The text to be displayed in the stream.
    pub text: String,
}

/// Data to be displayed in frontends, such as images or HTML.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DisplayData {
    /// The data to be displayed, typically a MIME type and the data itself.
    pub data: BTreeMap<String, serde_json::Value>,

    /// Metadata associated with the data, can be empty.
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Any information not to be persisted to a notebook.
    #[serde(default)]
    pub transient: Option<DisplayDataTransient>,
}

/// Transient data associated with display data, such as display IDs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DisplayDataTransient {
    /// Specifies an ID for the display, which can be updated.
    pub display_id: Option<String>,
}

/// Re-broadcast of code in an execute request to let all frontends know.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteInput {
    /// The code that was executed.
    pub code: String,

    /// The execution count, which increments with each request that stores
    /// history.
    pub execution_count: i32,
}

/// Results of a code execution, such as the output or return value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteResult {
    /// The execution count, which increments with each request that stores
    /// history.
    pub execution_count: i32,

    /// The data to be displayed, typically a MIME type and the data itself.
    /// A plain text representation should always be provided in the
    /// `text/plain` mime-type.
    pub data: BTreeMap<String, serde_json::Value>,

    /// Metadata associated with the data, can be empty.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Used by frontends to monitor the status of the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// Current status of the kernel.
    pub execution_state: KernelStatus,
}

/// Possible states of the kernel on the wire. When the kernel starts to
/// handle a message, it will enter the 'busy' state and when it finishes,
/// it will enter the 'idle' state. The kernel will publish state 'starting'
/// exactly once at process startup.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// The kernel is starting up.
    Starting,

    /// The kernel is ready to execute code.
    Idle,

    /// The kernel is currently executing code.
    Busy,
}

/// Request to clear output visible on the frontend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClearOutput {
    /// The wait flag, which if true, indicates that the frontend should
    /// wait for the clear output request to complete before sending further
    /// messages.
    pub wait: bool,
}
