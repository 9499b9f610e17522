//! Decoding of the streamed change-feed forms: newline-delimited JSON for
//! `feed=continuous` and text frames for `feed=websocket`.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use trellis_core::document::{ChangeRow, ChangesResponse, FeedEvent, Seq};
use trellis_core::error::{Result, TrellisError};
use trellis_core::peer::ChangeStream;

// ---------------------------------------------------------------------------
// Event decoding
// ---------------------------------------------------------------------------

/// Turn one decoded feed value into events.
///
/// Accepts a single row, a `{"last_seq": ..}` terminator, a full
/// `{"results": [..], "last_seq": ..}` response, or an array of rows (the
/// socket form, where an empty array means caught up).
fn events_from_value(value: Value, last_seq: &mut Seq) -> Result<Vec<FeedEvent>> {
    let obj = match value {
        Value::Array(rows) => {
            if rows.is_empty() {
                return Ok(vec![FeedEvent::LastSeq(last_seq.clone())]);
            }
            let mut events = Vec::with_capacity(rows.len());
            for row in rows {
                let row: ChangeRow = serde_json::from_value(row)?;
                *last_seq = row.seq.clone();
                events.push(FeedEvent::Change(row));
            }
            return Ok(events);
        }
        Value::Object(obj) => obj,
        other => {
            return Err(TrellisError::Json(format!(
                "unexpected change feed entry: {other}"
            )));
        }
    };

    if obj.contains_key("results") {
        let response: ChangesResponse = serde_json::from_value(Value::Object(obj))?;
        let mut events: Vec<FeedEvent> = response
            .results
            .into_iter()
            .map(FeedEvent::Change)
            .collect();
        *last_seq = response.last_seq.clone();
        events.push(FeedEvent::LastSeq(response.last_seq));
        return Ok(events);
    }
    if obj.contains_key("error") {
        let field = |k: &str| obj.get(k).and_then(|v| v.as_str()).unwrap_or_default();
        return Err(TrellisError::TransientNetwork(format!(
            "change feed error: {}: {}",
            field("error"),
            field("reason")
        )));
    }
    if obj.contains_key("last_seq") && !obj.contains_key("id") {
        let seq = obj
            .get("last_seq")
            .and_then(Seq::from_json)
            .unwrap_or_else(|| last_seq.clone());
        *last_seq = seq.clone();
        return Ok(vec![FeedEvent::LastSeq(seq)]);
    }
    let row: ChangeRow = serde_json::from_value(Value::Object(obj))?;
    *last_seq = row.seq.clone();
    Ok(vec![FeedEvent::Change(row)])
}

/// Incremental parser for a `feed=continuous` body.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence, so
/// input is buffered until a newline. Blank lines are heartbeats.
#[derive(Debug, Default)]
pub struct ChangesLineParser {
    buf: Vec<u8>,
    last_seq: Seq,
}

impl ChangesLineParser {
    pub fn new(since: Seq) -> Self {
        Self {
            buf: Vec::new(),
            last_seq: since,
        }
    }

    /// Feed a chunk, returning the events of every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<FeedEvent>> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.parse_line(&line, &mut events)?;
        }
        Ok(events)
    }

    /// Flush a final unterminated line at end of stream.
    pub fn finish(&mut self) -> Result<Vec<FeedEvent>> {
        let line = std::mem::take(&mut self.buf);
        let mut events = Vec::new();
        self.parse_line(&line, &mut events)?;
        Ok(events)
    }

    fn parse_line(&mut self, line: &[u8], events: &mut Vec<FeedEvent>) -> Result<()> {
        let text = std::str::from_utf8(line)
            .map_err(|e| TrellisError::Json(format!("change feed is not UTF-8: {e}")))?
            .trim();
        if text.is_empty() {
            return Ok(());
        }
        let value: Value = serde_json::from_str(text)?;
        events.extend(events_from_value(value, &mut self.last_seq)?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// A terminated response as a stream: its rows, then `LastSeq`.
pub(crate) fn terminated_stream(response: ChangesResponse) -> ChangeStream {
    let mut events: Vec<Result<FeedEvent>> = response
        .results
        .into_iter()
        .map(|row| Ok(FeedEvent::Change(row)))
        .collect();
    events.push(Ok(FeedEvent::LastSeq(response.last_seq)));
    Box::pin(futures_util::stream::iter(events))
}

struct LineFeed<S> {
    bytes: S,
    parser: ChangesLineParser,
    pending: VecDeque<FeedEvent>,
    idle: Duration,
    done: bool,
}

/// Decode a continuous body. Going `idle` without a single byte
/// (heartbeats included) fails the stream with a transient error.
pub(crate) fn continuous_stream<S, B>(bytes: S, since: Seq, idle: Duration) -> ChangeStream
where
    S: Stream<Item = Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = LineFeed {
        bytes,
        parser: ChangesLineParser::new(since),
        pending: VecDeque::new(),
        idle,
        done: false,
    };
    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            let decoded = match tokio::time::timeout(st.idle, st.bytes.next()).await {
                Err(_) => Err(TrellisError::TransientNetwork(format!(
                    "change feed idle for {:?}",
                    st.idle
                ))),
                Ok(None) => {
                    st.done = true;
                    st.parser.finish()
                }
                Ok(Some(Err(e))) => Err(e),
                Ok(Some(Ok(chunk))) => st.parser.push(chunk.as_ref()),
            };
            match decoded {
                Ok(events) => st.pending.extend(events),
                Err(e) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
            }
        }
    }))
}

/// Decode socket frames. Text and binary frames carry JSON; close ends the
/// stream. Control frames are answered by the socket itself.
pub(crate) fn socket_stream<S>(frames: S, since: Seq, idle: Duration) -> ChangeStream
where
    S: Stream<Item = Result<Message>> + Send + Unpin + 'static,
{
    let state = (frames, VecDeque::<FeedEvent>::new(), since, false);
    Box::pin(futures_util::stream::unfold(
        state,
        move |(mut frames, mut pending, mut last_seq, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (frames, pending, last_seq, done)));
                }
                if done {
                    return None;
                }
                let frame = match tokio::time::timeout(idle, frames.next()).await {
                    Err(_) => Err(TrellisError::TransientNetwork(format!(
                        "change socket idle for {idle:?}"
                    ))),
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                        done = true;
                        continue;
                    }
                    Ok(Some(Err(e))) => Err(e),
                    Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<Value>(text.as_str())
                        .map_err(TrellisError::from)
                        .and_then(|v| events_from_value(v, &mut last_seq)),
                    Ok(Some(Ok(Message::Binary(data)))) => serde_json::from_slice::<Value>(&data)
                        .map_err(TrellisError::from)
                        .and_then(|v| events_from_value(v, &mut last_seq)),
                    Ok(Some(Ok(_))) => continue,
                };
                match frame {
                    Ok(events) => pending.extend(events),
                    Err(e) => {
                        done = true;
                        return Some((Err(e), (frames, pending, last_seq, done)));
                    }
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn changes(events: &[FeedEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                FeedEvent::Change(row) => row.id.clone(),
                FeedEvent::LastSeq(seq) => format!("last:{seq}"),
            })
            .collect()
    }

    #[test]
    fn parser_handles_split_lines_and_heartbeats() {
        let mut parser = ChangesLineParser::new(Seq::zero());
        let first = parser
            .push(b"{\"seq\":1,\"id\":\"a\",\"changes\":[{\"rev\":\"1-a\"}]}\n\n{\"seq\":2,")
            .unwrap();
        assert_eq!(changes(&first), vec!["a"]);

        let second = parser
            .push(b"\"id\":\"b\",\"changes\":[{\"rev\":\"1-b\"}],\"deleted\":true}\n\n\n")
            .unwrap();
        assert_eq!(changes(&second), vec!["b"]);
        match &second[0] {
            FeedEvent::Change(row) => assert!(row.deleted),
            other => panic!("unexpected {other:?}"),
        }

        let end = parser.push(b"{\"last_seq\":\"2-opaque\"}\n").unwrap();
        assert_eq!(changes(&end), vec!["last:2-opaque"]);
        assert!(parser.finish().unwrap().is_empty());
    }

    #[test]
    fn parser_splits_inside_utf8() {
        let line = "{\"seq\":3,\"id\":\"caf\u{e9}\",\"changes\":[{\"rev\":\"1-x\"}]}\n";
        let bytes = line.as_bytes();
        let cut = line.find('\u{e9}').unwrap() + 1;
        let mut parser = ChangesLineParser::default();
        assert!(parser.push(&bytes[..cut]).unwrap().is_empty());
        assert_eq!(changes(&parser.push(&bytes[cut..]).unwrap()), vec!["caf\u{e9}"]);
    }

    #[test]
    fn parser_accepts_full_response_object() {
        let mut parser = ChangesLineParser::default();
        let body = json!({
            "results": [{"seq": 5, "id": "x", "changes": [{"rev": "1-x"}]}],
            "last_seq": 5
        });
        let events = parser.push(body.to_string().as_bytes()).unwrap();
        assert!(events.is_empty());
        assert_eq!(changes(&parser.finish().unwrap()), vec!["x", "last:5"]);
    }

    #[test]
    fn parser_reports_feed_errors() {
        let mut parser = ChangesLineParser::default();
        let err = parser
            .push(b"{\"error\":\"unknown_error\",\"reason\":\"boom\"}\n")
            .unwrap_err();
        assert!(err.is_transient());
        assert!(ChangesLineParser::default().push(b"{not json\n").is_err());
    }

    #[test]
    fn empty_socket_frame_means_caught_up() {
        let mut last = Seq::Num(7);
        let events = events_from_value(
            json!([{"seq": 8, "id": "d", "changes": [{"rev": "2-d"}]}]),
            &mut last,
        )
        .unwrap();
        assert_eq!(changes(&events), vec!["d"]);
        assert_eq!(last, Seq::Num(8));
        let events = events_from_value(json!([]), &mut last).unwrap();
        assert_eq!(events, vec![FeedEvent::LastSeq(Seq::Num(8))]);
    }

    #[tokio::test]
    async fn continuous_stream_yields_rows_then_ends() {
        let chunks: Vec<Result<Vec<u8>>> = vec![
            Ok(b"{\"seq\":1,\"id\":\"a\",\"changes\":[{\"rev\":\"1-a\"}]}\n".to_vec()),
            Ok(b"\n".to_vec()),
            Ok(b"{\"seq\":2,\"id\":\"b\",\"changes\":[{\"rev\":\"1-b\"}]}".to_vec()),
        ];
        let stream = continuous_stream(
            futures_util::stream::iter(chunks),
            Seq::zero(),
            Duration::from_secs(5),
        );
        let events: Vec<FeedEvent> = stream.map(|e| e.unwrap()).collect().await;
        assert_eq!(changes(&events), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn continuous_stream_times_out_when_idle() {
        let stream = continuous_stream(
            futures_util::stream::pending::<Result<Vec<u8>>>(),
            Seq::zero(),
            Duration::from_millis(20),
        );
        let events: Vec<Result<FeedEvent>> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].as_ref().unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn socket_stream_decodes_frames() {
        let frames: Vec<Result<Message>> = vec![
            Ok(Message::Text(
                json!([{"seq": 1, "id": "a", "changes": [{"rev": "1-a"}]}])
                    .to_string()
                    .into(),
            )),
            Ok(Message::Ping(Vec::new().into())),
            Ok(Message::Text("[]".to_string().into())),
            Ok(Message::Close(None)),
        ];
        let stream = socket_stream(
            futures_util::stream::iter(frames),
            Seq::zero(),
            Duration::from_secs(5),
        );
        let events: Vec<FeedEvent> = stream.map(|e| e.unwrap()).collect().await;
        assert_eq!(changes(&events), vec!["a", "last:1"]);
    }

    #[tokio::test]
    async fn terminated_stream_ends_with_last_seq() {
        let response: ChangesResponse = serde_json::from_value(json!({
            "results": [{"seq": 3, "id": "z", "changes": [{"rev": "1-z"}]}],
            "last_seq": 3
        }))
        .unwrap();
        let events: Vec<FeedEvent> = terminated_stream(response)
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(changes(&events), vec!["z", "last:3"]);
    }
}
