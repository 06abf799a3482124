//! HTTP/1.1 over local stream sockets.
//!
//! Both the hypervisor control socket and the guest agent channel speak plain HTTP/1.1 with
//! JSON bodies over a Unix-domain stream. This module wraps a hyper client connection bound to
//! one such stream.

use std::path::Path;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    client::conn::http1::{self, SendRequest},
    header, Method, Request, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UnixStream,
    task::JoinHandle,
};

use crate::SandcoreResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single HTTP/1.1 client connection over a stream.
pub struct HttpConnection {
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The response status.
    pub status: StatusCode,

    /// The response body.
    pub body: Bytes,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HttpConnection {
    /// Runs the HTTP/1.1 client handshake over an already connected stream.
    pub async fn handshake<S>(io: S) -> SandcoreResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "http connection closed");
            }
        });

        Ok(Self { sender, driver })
    }

    /// Connects to a Unix socket and runs the handshake.
    pub async fn connect_unix(path: impl AsRef<Path>) -> SandcoreResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Self::handshake(stream).await
    }

    /// Whether the peer has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Sends one request and buffers the whole response.
    pub async fn send(
        &mut self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> SandcoreResult<HttpResponse> {
        self.sender.ready().await?;

        let builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "localhost")
            .header(header::ACCEPT, "application/json");

        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::CONTENT_LENGTH, body.len())
                .body(Full::new(Bytes::from(body)))?,
            None => builder.body(Full::new(Bytes::new()))?,
        };

        let response = self.sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        Ok(HttpResponse { status, body })
    }
}

impl HttpResponse {
    /// The body as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::{
        testing::{self, RecordedRequest},
        *,
    };

    #[tokio::test]
    async fn test_send_round_trip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let socket = dir.path().join("api.sock");
        let log = testing::serve_at(
            &socket,
            Arc::new(|req: &RecordedRequest| {
                if req.path == "/missing" {
                    (404, r#"{"fault_message":"nope"}"#.to_string())
                } else {
                    (200, format!(r#"{{"echo":{}}}"#, req.body.len()))
                }
            }),
        );

        let mut conn = HttpConnection::connect_unix(&socket).await?;
        let response = conn
            .send(Method::PUT, "/boot-source", Some(b"{\"a\":1}".to_vec()))
            .await?;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), r#"{"echo":7}"#);

        let response = conn.send(Method::GET, "/missing", None).await?;
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        let recorded = log.lock().unwrap().clone();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].method, "PUT");
        assert_eq!(recorded[0].body, "{\"a\":1}");

        Ok(())
    }
}
