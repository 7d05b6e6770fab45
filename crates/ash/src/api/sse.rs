//! Server-Sent Events streaming.
//!
//! Frames are `event: <type>\ndata: <json>\n\n`. The body is produced from
//! the service's outbound channel, so kernel send-buffer backpressure
//! propagates through the channel to the bridge read loop; a stalled
//! consumer is cut off by the service's per-frame drain budget.

use axum::{
    body::Body,
    http::{Response, StatusCode, header},
};

use crate::session::{MessageStream, OutboundEvent};

/// Render one SSE frame.
pub fn format_frame(event: &OutboundEvent) -> String {
    format!("event: {}\ndata: {}\n\n", event.name, event.data)
}

/// Build the SSE response for a message stream.
pub fn sse_response(stream: MessageStream) -> Response<Body> {
    let mut rx = stream.rx;
    let body = Body::from_stream(async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok::<_, std::convert::Infallible>(format_frame(&event));
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_format() {
        let frame = format_frame(&OutboundEvent {
            name: "text_delta".to_string(),
            data: json!({ "delta": "Hel" }),
        });
        assert_eq!(frame, "event: text_delta\ndata: {\"delta\":\"Hel\"}\n\n");
    }

    #[test]
    fn test_frame_embedded_newlines_stay_escaped() {
        let frame = format_frame(&OutboundEvent {
            name: "message".to_string(),
            data: json!({ "text": "two\nlines" }),
        });
        // JSON escaping keeps the frame to exactly one data line.
        assert_eq!(frame.matches('\n').count(), 3);
    }
}
