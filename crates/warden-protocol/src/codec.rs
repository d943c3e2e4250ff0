//! Length-prefixed envelope framing.
//!
//! ```text
//! +----------------+--------------------+------------------+
//! | length: u16 BE | payload kind: u16  | data[length]     |
//! +----------------+--------------------+------------------+
//! ```
//!
//! `data` is the serialized [`Command`]: a JSON object for
//! [`PayloadKind::Json`], or a big-endian `u32` command type followed by the
//! raw payload for [`PayloadKind::Binary`].

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Command, CommandType, PayloadKind};

/// Size of the fixed envelope header.
pub const HEADER_LEN: usize = 4;

/// Largest body an envelope can advertise.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("short read: expected {expected} bytes, stream ended after {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("frame too large: {0} bytes exceeds {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Serialize, Deserialize)]
struct JsonBody {
    command_type: u32,
    #[serde(
        default,
        with = "crate::base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    data: Vec<u8>,
}

fn serialize_body(cmd: &Command, kind: PayloadKind) -> Result<Vec<u8>, CodecError> {
    let body = match kind {
        PayloadKind::Json => serde_json::to_vec(&JsonBody {
            command_type: cmd.kind().as_u32(),
            data: cmd.payload().to_vec(),
        })
        .map_err(|e| CodecError::MalformedPayload(e.to_string()))?,
        PayloadKind::Binary => {
            let mut body = Vec::with_capacity(4 + cmd.payload().len());
            body.extend_from_slice(&cmd.kind().as_u32().to_be_bytes());
            body.extend_from_slice(cmd.payload());
            body
        }
    };
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    Ok(body)
}

fn deserialize_body(kind: u16, data: &[u8]) -> Result<Command, CodecError> {
    match PayloadKind::from_u16(kind) {
        Some(PayloadKind::Json) => {
            let body: JsonBody = serde_json::from_slice(data)
                .map_err(|e| CodecError::MalformedPayload(format!("json: {e}")))?;
            Ok(Command::with_payload(
                CommandType::from(body.command_type),
                body.data,
            ))
        }
        Some(PayloadKind::Binary) => {
            if data.len() < 4 {
                return Err(CodecError::MalformedPayload(format!(
                    "binary body of {} bytes has no command type",
                    data.len()
                )));
            }
            let (head, payload) = data.split_at(4);
            let command_type = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
            Ok(Command::with_payload(
                CommandType::from(command_type),
                payload.to_vec(),
            ))
        }
        None => Err(CodecError::MalformedPayload(format!(
            "unsupported payload kind {kind}"
        ))),
    }
}

/// Encode a command into one complete envelope.
pub fn encode(cmd: &Command, kind: PayloadKind) -> Result<Vec<u8>, CodecError> {
    let body = serialize_body(cmd, kind)?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&kind.as_u16().to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read exactly one envelope from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
/// A stream that ends inside a header or body is a [`CodecError::ShortRead`].
pub async fn decode<R>(reader: &mut R) -> Result<Option<Command>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < HEADER_LEN {
        return Err(CodecError::ShortRead {
            expected: HEADER_LEN,
            got,
        });
    }

    let len = usize::from(u16::from_be_bytes([header[0], header[1]]));
    let kind = u16::from_be_bytes([header[2], header[3]]);

    let mut data = vec![0u8; len];
    let got = read_full(reader, &mut data).await?;
    if got < len {
        return Err(CodecError::ShortRead { expected: len, got });
    }

    deserialize_body(kind, &data).map(Some)
}

/// Fill `buf` until it is full or the reader hits EOF; returns bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Envelope codec for use with `FramedRead`/`FramedWrite`.
///
/// Outgoing commands are serialized with the configured payload kind;
/// incoming envelopes are accepted in either kind.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    kind: PayloadKind,
}

impl EnvelopeCodec {
    pub fn new(kind: PayloadKind) -> Self {
        Self { kind }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(PayloadKind::Json)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Command;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([src[0], src[1]]));
        let kind = u16::from_be_bytes([src[2], src[3]]);
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let data = src.split_to(len);
        deserialize_body(kind, &data).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        if let Some(cmd) = self.decode(src)? {
            return Ok(Some(cmd));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let expected = if src.len() < HEADER_LEN {
            HEADER_LEN
        } else {
            HEADER_LEN + usize::from(u16::from_be_bytes([src[0], src[1]]))
        };
        let got = src.len();
        src.clear();
        Err(CodecError::ShortRead { expected, got })
    }
}

impl Encoder<Command> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serialize_body(&cmd, self.kind)?;
        dst.reserve(HEADER_LEN + body.len());
        dst.put_u16(body.len() as u16);
        dst.put_u16(self.kind.as_u16());
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CustomCommandSpec, Hello};
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn header_is_big_endian_length_then_kind() {
        let frame = encode(&Command::exit(), PayloadKind::Binary).unwrap();
        assert_eq!(frame, vec![0, 4, 0, 2, 0, 0, 0, 2]);
    }

    #[test]
    fn json_body_carries_command_type_and_base64_data() {
        let cmd = Command::with_payload(CommandType::CustomCommand, b"{}".to_vec());
        let frame = encode(&cmd, PayloadKind::Json).unwrap();
        let len = usize::from(u16::from_be_bytes([frame[0], frame[1]]));
        assert_eq!(len, frame.len() - HEADER_LEN);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 1);
        let body: serde_json::Value = serde_json::from_slice(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(body["command_type"], 3);
        assert_eq!(body["data"], "e30=");
    }

    #[tokio::test]
    async fn decode_reads_exactly_one_frame() {
        let hello = Command::hello(&Hello {
            username: "alice".to_string(),
            pid: None,
            version: None,
        })
        .unwrap();
        let mut bytes = encode(&hello, PayloadKind::Json).unwrap();
        bytes.extend(encode(&Command::keep_alive(), PayloadKind::Binary).unwrap());

        let mut reader = bytes.as_slice();
        let first = decode(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, hello);
        let second = decode(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.kind(), CommandType::KeepAlive);
        assert!(decode(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn decode_fails_when_body_is_truncated() {
        let spec = CustomCommandSpec {
            cmd: "cmd.exe".to_string(),
            ..Default::default()
        };
        let frame = encode(&Command::custom(&spec).unwrap(), PayloadKind::Json).unwrap();
        let truncated = &frame[..frame.len() - 3];

        let mut reader = truncated;
        match decode(&mut reader).await {
            Err(CodecError::ShortRead { expected, got }) => {
                assert_eq!(expected, frame.len() - HEADER_LEN);
                assert_eq!(got, expected - 3);
            }
            other => panic!("expected short read, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn decode_fails_when_header_is_truncated() {
        let mut reader: &[u8] = &[0, 9, 0];
        assert!(matches!(
            decode(&mut reader).await,
            Err(CodecError::ShortRead {
                expected: HEADER_LEN,
                got: 3
            })
        ));
    }

    #[tokio::test]
    async fn decode_rejects_unparseable_json() {
        let mut frame = vec![0, 5, 0, 1];
        frame.extend_from_slice(b"nope!");
        let mut reader = frame.as_slice();
        assert!(matches!(
            decode(&mut reader).await,
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn decode_rejects_unknown_payload_kind() {
        let frame = vec![0, 4, 0, 9, 0, 0, 0, 1];
        let mut reader = frame.as_slice();
        assert!(matches!(
            decode(&mut reader).await,
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn decode_maps_unknown_command_numbers_to_unknown() {
        let frame = vec![0, 4, 0, 2, 0, 0, 1, 0];
        let mut reader = frame.as_slice();
        let cmd = decode(&mut reader).await.unwrap().unwrap();
        assert_eq!(cmd.kind(), CommandType::Unknown);
    }

    #[test]
    fn encode_refuses_oversized_payload() {
        let cmd = Command::with_payload(CommandType::Output, vec![7u8; MAX_FRAME_LEN]);
        assert!(matches!(
            encode(&cmd, PayloadKind::Binary),
            Err(CodecError::FrameTooLarge(n)) if n == MAX_FRAME_LEN + 4
        ));
    }

    #[tokio::test]
    async fn framed_codec_streams_commands_in_order() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, EnvelopeCodec::new(PayloadKind::Binary));
        let reader = FramedRead::new(server, EnvelopeCodec::default());

        writer.send(Command::lock_screen()).await.unwrap();
        writer.send(Command::keep_alive()).await.unwrap();
        writer.send(Command::exit()).await.unwrap();
        drop(writer);

        let kinds: Vec<CommandType> = reader
            .map(|r| r.unwrap().kind())
            .collect()
            .await;
        assert_eq!(
            kinds,
            vec![
                CommandType::LockScreen,
                CommandType::KeepAlive,
                CommandType::Exit
            ]
        );
    }

    #[test]
    fn framed_decoder_reports_short_read_at_eof() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::from(&[0u8, 10, 0, 1, b'{'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(CodecError::ShortRead {
                expected: 14,
                got: 5
            })
        ));
    }
}
