//! Minimal HTTP/1 client over hyper, shared by the traffic router and the
//! operator CLI.

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Send one request to `address` (`host:port`) and collect the response.
pub async fn request(
    method: Method,
    address: &str,
    path: &str,
    json_body: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<(StatusCode, Bytes), TransportError> {
    let exchange = async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|source| TransportError::Connect {
                address: address.to_string(),
                source,
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "connection closed with error");
            }
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, address)
            .header(USER_AGENT, concat!("modelrolld/", env!("CARGO_PKG_VERSION")));
        let body = match json_body {
            Some(body) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Full::new(Bytes::from(body))
            }
            None => Full::new(Bytes::new()),
        };
        let req = builder.body(body)?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        Ok((status, bytes))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%address, %path, "request timed out");
            Err(TransportError::Timeout(timeout))
        }
    }
}
