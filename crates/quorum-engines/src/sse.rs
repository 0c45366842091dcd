// crates/quorum-engines/src/sse.rs

//! Server-sent-event line splitting shared by the streaming adapters.

use crate::adapter::classify_transport_error;
use futures_util::StreamExt;
use quorum_core::error::ProviderResult;
use std::pin::Pin;

/// Payloads of the `data:` lines of an SSE response body, in arrival order.
///
/// Event-name and comment lines are dropped; the caller interprets the
/// payloads (including any `[DONE]` sentinel its vendor uses).
pub fn data_lines(
    response: reqwest::Response,
    provider: &'static str,
) -> Pin<Box<dyn futures::Stream<Item = ProviderResult<String>> + Send>> {
    Box::pin(async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(classify_transport_error(e, provider));
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end_matches('\r').to_string();
                buffer.drain(..=newline);
                if let Some(data) = line.strip_prefix("data:") {
                    yield Ok(data.trim_start().to_string());
                }
            }
        }
        // A final unterminated line still counts as an event payload.
        let tail = buffer.trim_end();
        if let Some(data) = tail.strip_prefix("data:") {
            yield Ok(data.trim_start().to_string());
        }
    })
}
