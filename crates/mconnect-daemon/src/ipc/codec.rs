use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::DaemonError;

/// Read a single JSONL message from an async buffered reader.
///
/// Returns `Ok(None)` when the stream is closed (EOF).
/// Returns `Err` on malformed JSON or IO errors.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, DaemonError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None); // EOF
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let msg: T = serde_json::from_str(trimmed)
        .map_err(|e| DaemonError::ProtocolError(format!("invalid JSON: {}: {}", e, trimmed)))?;
    Ok(Some(msg))
}

/// Write a single JSONL message to an async writer.
///
/// Serializes the message as compact JSON followed by a newline, then flushes.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(msg)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mconnect_protocol::{ClientRequest, DaemonResponse};

    #[tokio::test]
    async fn test_roundtrip_request() {
        let msg = ClientRequest::SessionList;

        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let parsed: Option<ClientRequest> = read_message(&mut reader).await.unwrap();
        assert!(matches!(parsed, Some(ClientRequest::SessionList)));
    }

    #[tokio::test]
    async fn test_roundtrip_response() {
        let msg = DaemonResponse::Ack;

        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let parsed: Option<DaemonResponse> = read_message(&mut reader).await.unwrap();
        assert!(matches!(parsed, Some(DaemonResponse::Ack)));
    }

    #[tokio::test]
    async fn test_read_eof() {
        let buf: &[u8] = b"";
        let mut reader = tokio::io::BufReader::new(buf);
        let result: Option<ClientRequest> = read_message(&mut reader).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_read_invalid_json() {
        let buf: &[u8] = b"not json\n";
        let mut reader = tokio::io::BufReader::new(buf);
        let result: Result<Option<ClientRequest>, _> = read_message(&mut reader).await;
        let err = result.unwrap_err();
        assert_eq!(err.error_code(), "protocol_error");
    }

    #[tokio::test]
    async fn test_multiple_messages() {
        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &ClientRequest::Ping).await.unwrap();
        write_message(&mut buf, &ClientRequest::Status).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());

        let first: ClientRequest = read_message(&mut reader).await.unwrap().unwrap();
        assert!(matches!(first, ClientRequest::Ping));

        let second: ClientRequest = read_message(&mut reader).await.unwrap().unwrap();
        assert!(matches!(second, ClientRequest::Status));

        let eof: Option<ClientRequest> = read_message(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }
}
