use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

/// Upper bound on how much of a failed upstream response is kept for logs
/// and error messages.
pub(crate) const MAX_ERROR_EXCERPT_BYTES: usize = 8 * 1024;

pub(crate) struct CappedBody {
    pub(crate) bytes: Bytes,
    pub(crate) truncated: bool,
}

/// Reads at most `max_bytes` of the body. A stream error ends the read early
/// with whatever arrived so far.
pub(crate) async fn read_body_capped(response: reqwest::Response, max_bytes: usize) -> CappedBody {
    let max_bytes = max_bytes.max(1);
    let mut buf = BytesMut::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(Ok(chunk)) = stream.next().await {
        let room = max_bytes.saturating_sub(buf.len());
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            truncated = true;
            break;
        }
        buf.extend_from_slice(&chunk);
    }

    CappedBody {
        bytes: buf.freeze(),
        truncated,
    }
}

/// A short, lossy text excerpt of an error response body.
pub(crate) async fn error_excerpt(response: reqwest::Response) -> String {
    let body = read_body_capped(response, MAX_ERROR_EXCERPT_BYTES).await;
    let mut text = String::from_utf8_lossy(&body.bytes).trim().to_string();
    if body.truncated {
        text.push_str(" ...(truncated)");
    }
    text
}
