use std::path::Path;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

use crate::{transport::HttpConnection, SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Longest handshake reply accepted from the vsock multiplexer.
const MAX_REPLY_LEN: usize = 64;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Opens an HTTP channel to the guest agent listening on vsock `port`.
///
/// The hypervisor exposes guest vsock ports through a Unix socket that expects a
/// `CONNECT <port>\n` line and answers `OK <host port>\n` once the guest accepted.
pub(crate) async fn open_channel(vsock: &Path, port: u32) -> SandcoreResult<HttpConnection> {
    let mut stream = UnixStream::connect(vsock).await.map_err(|e| {
        SandcoreError::AgentHandshake(format!("connect {}: {e}", vsock.display()))
    })?;

    stream
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await
        .map_err(|e| SandcoreError::AgentHandshake(format!("write: {e}")))?;

    let reply = read_reply(&mut stream).await?;
    if !reply.starts_with("OK") {
        return Err(SandcoreError::AgentHandshake(format!(
            "unexpected reply: {reply:?}"
        )));
    }

    tracing::trace!(vsock = %vsock.display(), %reply, "agent channel established");
    HttpConnection::handshake(stream).await
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Reads a single line one byte at a time so nothing past the newline is consumed.
async fn read_reply(stream: &mut UnixStream) -> SandcoreResult<String> {
    let mut line = Vec::with_capacity(16);
    loop {
        let byte = stream.read_u8().await.map_err(|e| {
            SandcoreError::AgentHandshake(format!(
                "connection closed during handshake after {:?}: {e}",
                String::from_utf8_lossy(&line)
            ))
        })?;

        if byte == b'\n' {
            break;
        }

        line.push(byte);
        if line.len() > MAX_REPLY_LEN {
            return Err(SandcoreError::AgentHandshake(
                "handshake reply too long".to_string(),
            ));
        }
    }

    Ok(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hyper::{Method, StatusCode};
    use tempfile::tempdir;

    use super::{testing::*, *};
    use crate::transport::testing::RecordedRequest;

    #[tokio::test]
    async fn test_handshake_then_http() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let vsock = dir.path().join("a.vsock");
        let agent = serve_agent(
            &vsock,
            |_| Behavior::Accept,
            Arc::new(|_: &RecordedRequest| (200, r#"{"status":"healthy"}"#.to_string())),
        );

        let mut conn = open_channel(&vsock, 9998).await?;
        let response = conn.send(Method::GET, "/health", None).await?;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(agent.handshakes.lock().unwrap().as_slice(), ["CONNECT 9998"]);
        assert_eq!(agent.requests.lock().unwrap()[0].path, "/health");

        Ok(())
    }

    #[tokio::test]
    async fn test_refused_handshake() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let vsock = dir.path().join("a.vsock");
        serve_agent(
            &vsock,
            |_| Behavior::Refuse,
            Arc::new(|_: &RecordedRequest| (200, "{}".to_string())),
        );

        let err = open_channel(&vsock, 9998).await.err().unwrap();
        assert!(matches!(err, SandcoreError::AgentHandshake(_)));

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_socket() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let err = open_channel(&dir.path().join("none.vsock"), 9998)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandcoreError::AgentHandshake(_)));

        Ok(())
    }
}
