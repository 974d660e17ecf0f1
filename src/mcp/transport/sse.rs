//! Server-Sent Events parsing shared by both transports
//!
//! The streaming transport may answer a POST with `text/event-stream`, and
//! the legacy transport is an event stream from the start. Both feed the raw
//! response body through [`parse_sse_stream`], which forwards one
//! [`SseEvent`] per dispatched event.
//!
//! Field handling:
//!
//! - `event:` sets the event type (defaults to `message`).
//! - `data:` lines are joined with `\n`.
//! - `id:` is carried on the event.
//! - `retry:` and `:` comment lines are ignored.
//! - `event: ping` and `data: [PING]` are dropped.

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

/// Default SSE event type.
pub const DEFAULT_EVENT: &str = "message";

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the block carried no `event:` field.
    pub event: String,
    /// Joined data payload.
    pub data: String,
    /// Last `id:` field of the block.
    pub id: Option<String>,
}

/// Consumes `byte_stream` until it ends or errors, forwarding each event.
///
/// Returns early once the receiving side of `tx` is dropped. Line endings may
/// be `\n` or `\r\n`, and events may be split across chunks at any byte.
pub async fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    tx: mpsc::UnboundedSender<SseEvent>,
) {
    use futures::StreamExt;

    let mut buffer: Vec<u8> = Vec::new();

    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "SSE stream ended with error");
                break;
            }
        };

        buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        while let Some(pos) = find_block_end(&buffer) {
            let block: Vec<u8> = buffer.drain(..pos + 2).collect();
            let text = String::from_utf8_lossy(&block[..pos]);
            if let Some(event) = parse_event_block(&text) {
                if tx.send(event).is_err() {
                    return;
                }
            }
        }
    }

    if !buffer.is_empty() {
        let text = String::from_utf8_lossy(&buffer);
        if let Some(event) = parse_event_block(&text) {
            let _ = tx.send(event);
        }
    }
}

/// Aborts the wrapped reader task when dropped.
#[derive(Debug)]
pub(crate) struct AbortOnDrop(tokio::task::AbortHandle);

impl AbortOnDrop {
    pub(crate) fn abort(&self) {
        self.0.abort();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns [`parse_sse_stream`] over `byte_stream`.
///
/// The reader stops as soon as the returned guard is dropped.
pub(crate) fn spawn_reader<S>(byte_stream: S) -> (AbortOnDrop, mpsc::UnboundedReceiver<SseEvent>)
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(parse_sse_stream(byte_stream, tx));
    (AbortOnDrop(task.abort_handle()), rx)
}

/// Drops every event still arriving on `events`.
///
/// Keeps the stream connection alive after a handshake without letting
/// unread events pile up in the channel. The task ends when the reader does.
pub(crate) fn discard_events(mut events: mpsc::UnboundedReceiver<SseEvent>) -> AbortOnDrop {
    let task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::trace!(event = %event.event, "Discarding unsolicited event");
        }
    });
    AbortOnDrop(task.abort_handle())
}

fn find_block_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Parses one event block (the text between two blank lines).
///
/// Returns `None` for blocks that carry no data and for keep-alive pings.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::mcp::transport::sse::parse_event_block;
///
/// let event = parse_event_block("event: endpoint\ndata: /messages?sessionId=1").unwrap();
/// assert_eq!(event.event, "endpoint");
/// assert_eq!(event.data, "/messages?sessionId=1");
/// ```
pub fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;
    let mut event_id: Option<&str> = None;

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("id:") {
            event_id = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
    }

    let event = event_type.unwrap_or(DEFAULT_EVENT);
    if event.eq_ignore_ascii_case("ping") {
        return None;
    }

    let data = data_lines.join("\n");
    if data.is_empty() || data.trim().eq_ignore_ascii_case("[ping]") {
        return None;
    }

    Some(SseEvent {
        event: event.to_string(),
        data,
        id: event_id.map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(chunks: Vec<&'static str>) -> Vec<SseEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, reqwest::Error>(Bytes::from_static(c.as_bytes()))),
        );
        parse_sse_stream(stream, tx).await;
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_single_data_event_defaults_to_message() {
        let events = collect(vec!["data: {\"jsonrpc\":\"2.0\"}\n\n"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, r#"{"jsonrpc":"2.0"}"#);
    }

    #[tokio::test]
    async fn test_event_split_across_chunks() {
        let events = collect(vec!["event: endp", "oint\ndata: /messages", "?s=1\n", "\n"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?s=1");
    }

    #[tokio::test]
    async fn test_crlf_line_endings() {
        let events = collect(vec!["event: message\r\ndata: a\r\n\r\ndata: b\r\n\r\n"]).await;
        let data: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_pings_are_dropped() {
        let events = collect(vec![
            "event: ping\ndata: ignored\n\ndata: [PING]\n\n: comment\n\ndata: real\n\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[tokio::test]
    async fn test_multiline_data_and_id() {
        let events = collect(vec!["id: evt-42\ndata: one\ndata: two\n\n"]).await;
        assert_eq!(events[0].data, "one\ntwo");
        assert_eq!(events[0].id.as_deref(), Some("evt-42"));
    }

    #[tokio::test]
    async fn test_trailing_block_without_terminator_is_flushed() {
        let events = collect(vec!["data: last"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "last");
    }

    #[tokio::test]
    async fn test_dropping_guard_stops_reader() {
        let (guard, mut rx) = spawn_reader(futures::stream::pending::<reqwest::Result<Bytes>>());
        drop(guard);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let stream = futures::stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from_static(
            b"data: a\n\ndata: b\n\n",
        ))]);
        parse_sse_stream(stream, tx).await;
    }

    #[tokio::test]
    async fn test_discard_events_consumes_backlog() {
        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..500 {
            tx.send(SseEvent {
                event: DEFAULT_EVENT.to_string(),
                data: format!("{{\"n\":{}}}", i),
                id: None,
            })
            .unwrap();
        }
        let drain = discard_events(rx);
        drop(tx);

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !drain.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("drain task should finish once the sender is gone");
    }

    #[tokio::test]
    async fn test_discard_events_stops_when_guard_dropped() {
        let (tx, rx) = mpsc::unbounded_channel::<SseEvent>();
        drop(discard_events(rx));
        tokio::time::timeout(std::time::Duration::from_secs(1), tx.closed())
            .await
            .expect("receiver should be released after abort");
    }
}
