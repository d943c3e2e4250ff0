pub mod codec;
pub mod paths;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use codec::{CodecError, EnvelopeCodec, HEADER_LEN, MAX_FRAME_LEN, decode, encode};

/// Opaque identifier handed to an agent when its registration is accepted.
pub type ClientId = String;

/// Kind of a command travelling between the master and an agent.
///
/// The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Unknown,
    LockScreen,
    Exit,
    CustomCommand,
    KeepAlive,
    Hello,
    Response,
    Output,
}

impl CommandType {
    pub fn as_u32(self) -> u32 {
        match self {
            CommandType::Unknown => 0,
            CommandType::LockScreen => 1,
            CommandType::Exit => 2,
            CommandType::CustomCommand => 3,
            CommandType::KeepAlive => 4,
            CommandType::Hello => 5,
            CommandType::Response => 6,
            CommandType::Output => 7,
        }
    }
}

impl From<u32> for CommandType {
    fn from(value: u32) -> Self {
        match value {
            1 => CommandType::LockScreen,
            2 => CommandType::Exit,
            3 => CommandType::CustomCommand,
            4 => CommandType::KeepAlive,
            5 => CommandType::Hello,
            6 => CommandType::Response,
            7 => CommandType::Output,
            _ => CommandType::Unknown,
        }
    }
}

/// How the body of an envelope is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Json,
    Binary,
}

impl PayloadKind {
    pub fn as_u16(self) -> u16 {
        match self {
            PayloadKind::Json => 1,
            PayloadKind::Binary => 2,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(PayloadKind::Json),
            2 => Some(PayloadKind::Binary),
            _ => None,
        }
    }
}

/// A single instruction or report carried by one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandType,
    payload: Vec<u8>,
}

impl Command {
    pub fn new(kind: CommandType) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(kind: CommandType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Build a command whose payload is the JSON encoding of `value`.
    pub fn with_json<T: Serialize>(kind: CommandType, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: serde_json::to_vec(value)?,
        })
    }

    pub fn exit() -> Self {
        Self::new(CommandType::Exit)
    }

    pub fn keep_alive() -> Self {
        Self::new(CommandType::KeepAlive)
    }

    pub fn lock_screen() -> Self {
        Self::new(CommandType::LockScreen)
    }

    pub fn hello(hello: &Hello) -> Result<Self, serde_json::Error> {
        Self::with_json(CommandType::Hello, hello)
    }

    pub fn response(reply: &Reply) -> Result<Self, serde_json::Error> {
        Self::with_json(CommandType::Response, reply)
    }

    pub fn custom(spec: &CustomCommandSpec) -> Result<Self, serde_json::Error> {
        Self::with_json(CommandType::CustomCommand, spec)
    }

    pub fn output(chunk: &OutputChunk) -> Result<Self, serde_json::Error> {
        Self::with_json(CommandType::Output, chunk)
    }

    pub fn kind(&self) -> CommandType {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// First frame an agent sends after connecting.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Outcome report, used for the registration reply and for command results.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    pub fn accepted(client_id: ClientId) -> Self {
        Self {
            ok: true,
            client_id: Some(client_id),
            code: None,
            message: None,
        }
    }

    pub fn ok() -> Self {
        Self {
            ok: true,
            client_id: None,
            code: None,
            message: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            client_id: None,
            code: Some(code),
            message: Some(message.into()),
        }
    }
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DuplicateUser,
    NotConnected,
    QueueFull,
    InvalidRequest,
    ActionFailed,
    ServerError,
}

/// A program the agent runs inside the user's session.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomCommandSpec {
    #[serde(default)]
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

/// Which stream an [`OutputChunk`] belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    Exit,
}

/// Output produced by a custom command, streamed back to the master.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    #[serde(default)]
    pub name: String,
    pub stream: OutputStream,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Base64 encoding for byte arrays in JSON.
pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_type_numbers_are_stable() {
        for (n, kind) in [
            (0, CommandType::Unknown),
            (1, CommandType::LockScreen),
            (2, CommandType::Exit),
            (3, CommandType::CustomCommand),
            (4, CommandType::KeepAlive),
            (5, CommandType::Hello),
            (6, CommandType::Response),
            (7, CommandType::Output),
        ] {
            assert_eq!(kind.as_u32(), n);
            assert_eq!(CommandType::from(n), kind);
        }
        assert_eq!(CommandType::from(999), CommandType::Unknown);
    }

    #[test]
    fn payload_kind_rejects_unknown_tag() {
        assert_eq!(PayloadKind::from_u16(1), Some(PayloadKind::Json));
        assert_eq!(PayloadKind::from_u16(2), Some(PayloadKind::Binary));
        assert_eq!(PayloadKind::from_u16(0), None);
        assert_eq!(PayloadKind::from_u16(7), None);
    }

    #[test]
    fn hello_payload_parses_from_json_command() {
        let hello = Hello {
            username: r"CORP\alice".to_string(),
            pid: Some(42),
            version: None,
        };
        let cmd = Command::hello(&hello).unwrap();
        assert_eq!(cmd.kind(), CommandType::Hello);
        let parsed: Hello = cmd.json().unwrap();
        assert_eq!(parsed, hello);
        assert!(!String::from_utf8_lossy(cmd.payload()).contains("version"));
    }

    #[test]
    fn reply_error_uses_snake_case_code() {
        let reply = Reply::error(ErrorCode::DuplicateUser, "alice already has an agent");
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"duplicate_user\""));
        assert!(!json.contains("client_id"));
        let parsed: Reply = serde_json::from_str(&json).unwrap();
        assert!(!parsed.ok);
        assert_eq!(parsed.code, Some(ErrorCode::DuplicateUser));
    }

    #[test]
    fn custom_command_spec_defaults() {
        let json = r#"{"cmd":"notepad.exe"}"#;
        let spec: CustomCommandSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.cmd, "notepad.exe");
        assert!(spec.args.is_empty());
        assert!(spec.env.is_empty());
        assert!(spec.workdir.is_none());
    }

    #[test]
    fn output_chunk_data_is_base64() {
        let chunk = OutputChunk {
            name: "build".to_string(),
            stream: OutputStream::Stdout,
            data: b"hello world".to_vec(),
            exit_code: None,
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(!json.contains("hello world"));
        assert!(json.contains("\"stdout\""));
        let parsed: OutputChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.data, b"hello world");
    }

    #[test]
    fn exit_chunk_omits_empty_data() {
        let chunk = OutputChunk {
            name: String::new(),
            stream: OutputStream::Exit,
            data: Vec::new(),
            exit_code: Some(3),
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(!json.contains("data"));
        let parsed: OutputChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.exit_code, Some(3));
        assert!(parsed.data.is_empty());
    }
}
