//! The HTTP seam and its reqwest implementation.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header;
use url::Url;

use longwire_core::negotiate::PROTOCOL_VERSION;
use longwire_core::{Cursor, TransportError, TransportResult};

/// A chunked byte stream from a streaming response.
pub type ByteStream = Pin<Box<dyn Stream<Item = TransportResult<Bytes>> + Send>>;

/// The request surface every client transport goes through.
///
/// Production code uses [`ReqwestRequester`]; tests inject scripted
/// implementations to drive the failure taxonomy.
#[async_trait]
pub trait HttpRequester: Send + Sync + fmt::Debug {
    /// Issues a POST and returns the response body.
    async fn post(&self, url: &str, body: Option<String>) -> TransportResult<String>;

    /// Opens a streaming GET and returns its chunked body.
    async fn get_stream(&self, url: &str) -> TransportResult<ByteStream>;
}

/// Query parameters shared by the receive endpoints.
#[derive(Debug, Clone, Default)]
pub struct ReceiveParams {
    /// Last cursor the client observed.
    pub message_id: Option<Cursor>,
    /// Group-membership token to echo back.
    pub groups_token: Option<String>,
    /// Frame identifier (forever frame only).
    pub frame_id: Option<String>,
}

fn parse_base(base_url: &str) -> TransportResult<Url> {
    // A missing trailing slash would make Url::join replace the final path
    // segment instead of appending the endpoint.
    let normalized = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    Url::parse(&normalized)
        .map_err(|e| TransportError::ConfigurationError(format!("invalid base url: {e}")))
}

fn join(base: &Url, endpoint: &str) -> TransportResult<Url> {
    base.join(endpoint)
        .map_err(|e| TransportError::ConfigurationError(format!("invalid endpoint: {e}")))
}

/// Builds the `negotiate` URL.
///
/// # Errors
///
/// Returns [`TransportError::ConfigurationError`] for an unparsable base URL.
pub fn negotiate_url(base_url: &str, connection_data: Option<&str>) -> TransportResult<String> {
    let base = parse_base(base_url)?;
    let mut url = join(&base, "negotiate")?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("clientProtocol", PROTOCOL_VERSION);
        if let Some(data) = connection_data {
            query.append_pair("connectionData", data);
        }
    }
    Ok(url.into())
}

/// Builds a `connect`/`reconnect`/`poll` URL carrying the common parameters
/// plus the last cursor and group token.
///
/// # Errors
///
/// Returns [`TransportError::ConfigurationError`] for an unparsable base URL.
pub fn receive_url(
    base_url: &str,
    endpoint: &str,
    transport: &str,
    connection_token: &str,
    connection_data: Option<&str>,
    params: &ReceiveParams,
) -> TransportResult<String> {
    let base = parse_base(base_url)?;
    let mut url = join(&base, endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("clientProtocol", PROTOCOL_VERSION);
        query.append_pair("transport", transport);
        query.append_pair("connectionToken", connection_token);
        if let Some(data) = connection_data {
            query.append_pair("connectionData", data);
        }
        if let Some(cursor) = params.message_id {
            query.append_pair("messageId", &cursor.to_string());
        }
        if let Some(groups) = &params.groups_token {
            query.append_pair("groupsToken", groups);
        }
        if let Some(frame) = &params.frame_id {
            query.append_pair("frameId", frame);
        }
    }
    Ok(url.into())
}

/// Builds a `send` or `abort` URL.
///
/// # Errors
///
/// Returns [`TransportError::ConfigurationError`] for an unparsable base URL.
pub fn control_url(
    base_url: &str,
    endpoint: &str,
    transport: &str,
    connection_token: &str,
    connection_data: Option<&str>,
) -> TransportResult<String> {
    let base = parse_base(base_url)?;
    let mut url = join(&base, endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("clientProtocol", PROTOCOL_VERSION);
        query.append_pair("transport", transport);
        query.append_pair("connectionToken", connection_token);
        if let Some(data) = connection_data {
            query.append_pair("connectionData", data);
        }
    }
    Ok(url.into())
}

/// [`HttpRequester`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestRequester {
    client: reqwest::Client,
}

impl ReqwestRequester {
    /// Builds a requester with no per-request timeout.
    ///
    /// Long-lived receive requests outlast any reasonable global timeout;
    /// callers bound their own waits instead.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConfigurationError`] if the underlying
    /// client cannot be constructed.
    pub fn new() -> TransportResult<Self> {
        Self::with_connect_timeout(Duration::from_secs(30))
    }

    /// Builds a requester with a specific connect timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConfigurationError`] if the underlying
    /// client cannot be constructed.
    pub fn with_connect_timeout(connect_timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| {
                TransportError::ConfigurationError(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self { client })
    }

    fn classify(err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::ConnectionFailed(err.to_string())
        } else if err.is_decode() || err.is_body() {
            // Transfer interrupted mid-stream: the benign-disconnect class.
            TransportError::ConnectionLost(err.to_string())
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

#[async_trait]
impl HttpRequester for ReqwestRequester {
    async fn post(&self, url: &str, body: Option<String>) -> TransportResult<String> {
        let mut request = self.client.post(url);
        if let Some(body) = body {
            request = request
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body);
        }

        let response = request.send().await.map_err(|e| Self::classify(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::ProtocolError(format!(
                "unexpected status {status}"
            )));
        }
        response.text().await.map_err(|e| Self::classify(&e))
    }

    async fn get_stream(&self, url: &str) -> TransportResult<ByteStream> {
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Self::classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::ProtocolError(format!(
                "unexpected status {status}"
            )));
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| TransportError::ConnectionLost(e.to_string()))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_url_carries_protocol() {
        let url = negotiate_url("http://host:1234/wire/", Some("hub")).unwrap();
        assert!(url.starts_with("http://host:1234/wire/negotiate?"));
        assert!(url.contains("clientProtocol=1.5"));
        assert!(url.contains("connectionData=hub"));
    }

    #[test]
    fn test_receive_url_carries_cursor_and_groups() {
        let params = ReceiveParams {
            message_id: Some(Cursor::new(12)),
            groups_token: Some("g token".to_string()),
            frame_id: None,
        };
        let url = receive_url(
            "http://host/wire/",
            "reconnect",
            "longPolling",
            "tok",
            None,
            &params,
        )
        .unwrap();

        assert!(url.contains("transport=longPolling"));
        assert!(url.contains("connectionToken=tok"));
        assert!(url.contains("messageId=12"));
        assert!(url.contains("groupsToken=g+token"));
    }

    #[test]
    fn test_control_url_omits_receive_parameters() {
        let url = control_url("http://host/wire/", "abort", "webSockets", "tok", None).unwrap();
        assert!(url.contains("/abort?"));
        assert!(!url.contains("messageId"));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(negotiate_url("not a url", None).is_err());
    }
}
