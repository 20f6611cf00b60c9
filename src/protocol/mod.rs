//! Wire protocol: length-prefixed JSON framing and request types.
//!
//! Every message on the socket is a 4-byte big-endian length followed by
//! that many bytes of UTF-8 JSON; a zero-length frame terminates
//! multi-frame responses. Sync responses carry raw PCM frames instead of
//! JSON between the request and the terminator.

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DaemonError;

/// Upper bound on a single frame; anything larger is a malformed request.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A parsed client request. One connection carries exactly one of these.
#[derive(Debug, Clone)]
pub enum Request {
    /// Blocking caller: stream PCM frames straight back on this connection.
    Sync(SpeakRequest),
    /// Fire-and-forget: hand to the playback queue, answer with a position.
    Enqueue(SpeakRequest),
    /// Control: answered from queue + cache state.
    Command(Command),
}

/// Speech parameters shared by the sync and enqueue paths.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub caller: Option<String>,
}

fn default_voice() -> String {
    "af_heart".to_string()
}

fn default_speed() -> f64 {
    1.0
}

fn default_lang() -> String {
    "en-us".to_string()
}

/// Queue/cache control commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum Command {
    QueueStatus {},
    Skip {},
    Clear {},
    Replay {},
    Stats {},
    History {
        #[serde(default = "default_history_n")]
        n: usize,
    },
    /// Keep the connection open and stream broadcast frames.
    Subscribe {
        #[serde(default = "default_true")]
        include_metadata: bool,
    },
}

fn default_history_n() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Classify and parse a request payload.
///
/// Dispatch mirrors the wire contract: a `command` field makes it a
/// command, an `enqueue: true` flag makes it an enqueue, anything else
/// must be a sync speech request with non-empty text.
pub fn parse_request(payload: &[u8]) -> Result<Request, DaemonError> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| DaemonError::MalformedRequest(e.to_string()))?;

    if value.get("command").is_some() {
        let command = Command::deserialize(&value)
            .map_err(|e| DaemonError::MalformedRequest(e.to_string()))?;
        return Ok(Request::Command(command));
    }

    let enqueue = value
        .get("enqueue")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let speak = SpeakRequest::deserialize(&value)
        .map_err(|e| DaemonError::MalformedRequest(e.to_string()))?;
    if speak.text.trim().is_empty() {
        return Err(DaemonError::MalformedRequest("empty text".to_string()));
    }
    Ok(if enqueue {
        Request::Enqueue(speak)
    } else {
        Request::Sync(speak)
    })
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Read one length-prefixed frame. `Ok(None)` is the zero-length
/// terminator.
pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("frame of {} bytes exceeds limit", len);
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Write one broadcast frame: the length prefix covers a leading kind
/// byte (audio or metadata) plus the payload.
pub async fn write_broadcast_frame<W>(writer: &mut W, kind: u8, payload: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(payload.len() as u32 + 1).await?;
    writer.write_u8(kind).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write the zero-length end-of-stream terminator.
pub async fn write_terminator<W>(writer: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(0).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one JSON frame followed by the terminator — the complete
/// response for enqueue, command, and error paths.
pub async fn write_json<W>(writer: &mut W, value: &serde_json::Value) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, &payload).await?;
    write_terminator(writer).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_request_with_defaults() {
        let req = parse_request(br#"{"text": "hello"}"#).unwrap();
        match req {
            Request::Sync(s) => {
                assert_eq!(s.text, "hello");
                assert_eq!(s.voice, "af_heart");
                assert!((s.speed - 1.0).abs() < 1e-9);
                assert_eq!(s.lang, "en-us");
            }
            other => panic!("expected sync, got {other:?}"),
        }
    }

    #[test]
    fn enqueue_flag_routes_to_queue() {
        let req =
            parse_request(br#"{"enqueue": true, "text": "hi", "caller": "ops"}"#).unwrap();
        match req {
            Request::Enqueue(s) => assert_eq!(s.caller.as_deref(), Some("ops")),
            other => panic!("expected enqueue, got {other:?}"),
        }
    }

    #[test]
    fn commands_parse() {
        assert!(matches!(
            parse_request(br#"{"command": "queue_status"}"#).unwrap(),
            Request::Command(Command::QueueStatus {})
        ));
        assert!(matches!(
            parse_request(br#"{"command": "history", "n": 3}"#).unwrap(),
            Request::Command(Command::History { n: 3 })
        ));
        assert!(matches!(
            parse_request(br#"{"command": "replay"}"#).unwrap(),
            Request::Command(Command::Replay {})
        ));
        // Metadata is on by default for subscribers.
        assert!(matches!(
            parse_request(br#"{"command": "subscribe"}"#).unwrap(),
            Request::Command(Command::Subscribe {
                include_metadata: true
            })
        ));
        assert!(matches!(
            parse_request(br#"{"command": "subscribe", "include_metadata": false}"#).unwrap(),
            Request::Command(Command::Subscribe {
                include_metadata: false
            })
        ));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            parse_request(b"not json"),
            Err(DaemonError::MalformedRequest(_))
        ));
        assert!(matches!(
            parse_request(br#"{"command": "no_such_command"}"#),
            Err(DaemonError::MalformedRequest(_))
        ));
        assert!(matches!(
            parse_request(br#"{"text": "   "}"#),
            Err(DaemonError::MalformedRequest(_))
        ));
        assert!(matches!(
            parse_request(br#"{"voice": "v1"}"#),
            Err(DaemonError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn framing_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"payload").await.unwrap();
        write_terminator(&mut client).await.unwrap();

        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"payload"[..]));
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn length_prefix_is_big_endian() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &[0xAB; 3]).await.unwrap();
        drop(client);

        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(&raw[..4], &[0, 0, 0, 3]);
    }

    #[tokio::test]
    async fn broadcast_frame_carries_the_kind_byte() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_broadcast_frame(&mut client, 1, &[0x10, 0x20]).await.unwrap();

        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame, vec![1, 0x10, 0x20]);
    }

    #[tokio::test]
    async fn oversized_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_u32(&mut client, MAX_FRAME_BYTES + 1)
            .await
            .unwrap();
        assert!(read_frame(&mut server).await.is_err());
    }
}
