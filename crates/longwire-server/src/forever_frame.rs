//! Iframe-streaming encoding: script fragments inside a never-ending page.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use longwire_core::{Cursor, Envelope, TransportError, TransportResult};

use crate::forever::{ForeverTransport, LoopEntry, WireWriter};
use crate::heartbeat::TrackedConnection;

/// Receiver function the embedding page must expose on `window.parent`.
const RECEIVER_FN: &str = "longwireFrame";

/// Bytes of padding after the preamble so buffering proxies flush it.
const PADDING_LEN: usize = 1024;

/// Renders the initialization preamble, written once before any envelope.
///
/// The frame identifier comes from the request's query string and is handed
/// to the receiver function so the embedding page can route fragments to
/// the right frame.
#[must_use]
pub fn preamble(frame_id: &str) -> Bytes {
    let escaped = frame_id.replace('\\', "\\\\").replace('"', "\\\"");
    let padding = " ".repeat(PADDING_LEN);
    Bytes::from(format!(
        "<!DOCTYPE html>\r\n\
         <html>\r\n\
         <head><title>Longwire Forever Frame</title></head>\r\n\
         <body>\r\n\
         <script>var f = window.parent.{RECEIVER_FN}(\"{escaped}\");</script>\r\n\
         <!--{padding}-->\r\n"
    ))
}

/// Renders one envelope as a script fragment, optionally echoed in a
/// human-readable `<div>` when debug mode is on.
#[must_use]
pub fn script_fragment(envelope: &Envelope, debug: bool) -> Bytes {
    let payload = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    let mut out = format!("<script>f.frame({payload});</script>\r\n");
    if debug {
        let escaped = payload.replace('&', "&amp;").replace('<', "&lt;");
        out.push_str(&format!("<div>{escaped}</div>\r\n"));
    }
    Bytes::from(out)
}

/// Forwards envelopes from the receive loop into the page stream.
#[derive(Debug)]
struct FrameWriter {
    tx: mpsc::Sender<Envelope>,
}

#[async_trait]
impl WireWriter for FrameWriter {
    async fn send_envelope(&self, envelope: &Envelope) -> TransportResult<()> {
        self.tx
            .send(envelope.clone())
            .await
            .map_err(|_| TransportError::SendFailed("frame stream closed".to_string()))
    }
}

/// The forever-frame specialization of the shared skeleton.
pub struct ForeverFrameTransport {
    forever: Arc<ForeverTransport>,
    debug: bool,
}

impl ForeverFrameTransport {
    /// Wraps the skeleton for forever-frame streaming.
    #[must_use]
    pub fn new(forever: Arc<ForeverTransport>, debug: bool) -> Self {
        Self { forever, debug }
    }

    /// Builds the streaming HTML response for a connect/reconnect request.
    pub fn into_response(
        self,
        frame_id: &str,
        entry: LoopEntry,
        cursor: Option<Cursor>,
        cancel: CancellationToken,
    ) -> Response {
        let (tx, mut rx) = mpsc::channel::<Envelope>(16);
        let forever = Arc::clone(&self.forever);
        let connection_id = forever.connection().connection_id().to_string();

        tokio::spawn(async move {
            let writer = FrameWriter { tx };
            match forever.run_until_terminal(&writer, entry, cursor, cancel).await {
                Ok(outcome) => {
                    debug!(connection_id = %connection_id, ?outcome, "forever frame loop finished")
                }
                Err(err) if err.is_cancellation() => {
                    debug!(connection_id = %connection_id, "forever frame loop cancelled");
                }
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "forever frame loop failed");
                }
            }
            forever.connection().mark_inactive();
        });

        let head = preamble(frame_id);
        let debug_mode = self.debug;
        let stream = async_stream::stream! {
            yield Ok::<Bytes, std::convert::Infallible>(head);
            while let Some(envelope) = rx.recv().await {
                yield Ok(script_fragment(&envelope, debug_mode));
            }
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .expect("static response parts are valid")
    }
}

impl fmt::Debug for ForeverFrameTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeverFrameTransport")
            .field("debug", &self.debug)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_preamble_carries_frame_id() {
        let bytes = preamble("frame-7");
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("window.parent.longwireFrame(\"frame-7\")"));
        assert!(text.len() > PADDING_LEN);
    }

    #[test]
    fn test_preamble_escapes_frame_id() {
        let bytes = preamble("x\"y");
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("longwireFrame(\"x\\\"y\")"));
    }

    #[test]
    fn test_script_fragment_inlines_envelope_json() {
        let envelope = Envelope::at(Cursor::new(4)).with_messages(vec![json!("hi")]);
        let bytes = script_fragment(&envelope, false);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(
            text,
            "<script>f.frame({\"cursor\":4,\"messages\":[\"hi\"]});</script>\r\n"
        );
    }

    #[test]
    fn test_debug_mode_appends_div_echo() {
        let envelope = Envelope::at(Cursor::new(1));
        let text = String::from_utf8(script_fragment(&envelope, true).to_vec()).unwrap();
        assert!(text.contains("<div>"));
    }
}
