// ABOUTME: Incremental decoding of entity batches from a request body
// ABOUTME: Array elements are decoded one at a time so a batch never has to fit in memory

use std::fmt;
use std::io::{self, BufReader, Read};

use bytes::Bytes;
use futures::Stream;
use serde::de::{self, Deserializer as _, SeqAccess, Visitor};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};

use super::{decode_entity, Entity};
use crate::error::BridgeError;

/// Entities decoded ahead of the writer before the parser waits.
const READ_AHEAD: usize = 64;

/// Decode a JSON array of entities from `reader`, handing each element to
/// `emit` as soon as it is complete.
///
/// Returning `false` from `emit` stops parsing. A syntax error, or a top level
/// that is not an array, is emitted once as a [`BridgeError::Decode`].
pub fn read_entities<R, F>(reader: R, mut emit: F)
where
    R: Read,
    F: FnMut(Result<Entity, BridgeError>) -> bool,
{
    let mut stopped = false;
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    let result = (&mut deserializer)
        .deserialize_seq(EntitySeq {
            emit: &mut emit,
            stopped: &mut stopped,
        })
        .and_then(|()| deserializer.end());

    if let Err(e) = result {
        if !stopped {
            emit(Err(BridgeError::decode(
                "<batch>",
                format!("invalid batch: {}", e),
            )));
        }
    }
}

struct EntitySeq<'a, F> {
    emit: &'a mut F,
    stopped: &'a mut bool,
}

impl<'de, F> Visitor<'de> for EntitySeq<'_, F>
where
    F: FnMut(Result<Entity, BridgeError>) -> bool,
{
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a JSON array of entities")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(value) = seq.next_element::<JsonValue>()? {
            if !(self.emit)(decode_entity(value)) {
                *self.stopped = true;
                return Err(de::Error::custom("entity consumer went away"));
            }
        }
        Ok(())
    }
}

/// Decode a request body into a stream of entities.
///
/// Parsing runs on a blocking thread and stays at most a few entities ahead of
/// the consumer. Dropping the stream stops the parser at the next element.
/// Must be called from within a tokio runtime.
pub fn entity_stream<S>(body: S) -> ReceiverStream<Result<Entity, BridgeError>>
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(READ_AHEAD);
    let reader = BufReader::new(SyncIoBridge::new(StreamReader::new(Box::pin(body))));

    tokio::task::spawn_blocking(move || {
        read_entities(reader, |entity| tx.blocking_send(entity).is_ok());
    });
    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, StreamExt};

    fn collect(text: &str) -> Vec<Result<Entity, BridgeError>> {
        let mut out = Vec::new();
        read_entities(text.as_bytes(), |entity| {
            out.push(entity);
            true
        });
        out
    }

    #[test]
    fn test_reads_each_element() {
        let entities = collect(r#"[{"id": 1, "color": "red"}, {"id": 2, "_deleted": true}]"#);
        assert_eq!(entities.len(), 2);

        let second = entities[1].as_ref().unwrap();
        assert!(second.is_deleted());
        assert_eq!(second.get("id").and_then(|v| v.to_plain_string()).as_deref(), Some("2"));
    }

    #[test]
    fn test_empty_array() {
        assert!(collect("[]").is_empty());
        assert!(collect(" [ ] \n").is_empty());
    }

    #[test]
    fn test_bad_element_is_reported_in_place() {
        let entities = collect(r#"[{"id": 1}, 5, {"id": 3}]"#);
        assert_eq!(entities.len(), 3);
        assert!(entities[0].is_ok());
        assert!(entities[1].is_err());
        assert!(entities[2].is_ok());
    }

    #[test]
    fn test_syntax_error_after_valid_elements() {
        let entities = collect(r#"[{"id": 1}, {"id": "#);
        assert_eq!(entities.len(), 2);
        assert!(entities[0].is_ok());
        match &entities[1] {
            Err(BridgeError::Decode { reason, .. }) => assert!(reason.contains("invalid batch")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_top_level_must_be_array() {
        let entities = collect(r#"{"id": 1}"#);
        assert_eq!(entities.len(), 1);
        match &entities[0] {
            Err(e) => assert!(e.to_string().contains("expected a JSON array")),
            Ok(_) => panic!("object accepted as a batch"),
        }

        assert!(collect("[] []").last().is_some_and(|e| e.is_err()));
    }

    #[test]
    fn test_stops_when_consumer_declines() {
        let mut seen = 0;
        read_entities(r#"[{"id": 1}, {"id": 2}, {"id": 3}]"#.as_bytes(), |_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_entity_stream_across_chunk_boundaries() {
        let chunks = vec![
            Ok(Bytes::from_static(b"[{\"id\": 1, \"na")),
            Ok(Bytes::from_static(b"me\": \"bolt\"}, {\"id\"")),
            Ok(Bytes::from_static(b": 2}]")),
        ];
        let entities: Vec<_> = entity_stream(stream::iter(chunks)).collect().await;

        assert_eq!(entities.len(), 2);
        let first = entities[0].as_ref().unwrap();
        assert_eq!(first.get("name").and_then(|v| v.to_plain_string()).as_deref(), Some("bolt"));
        assert!(entities[1].is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_entity_stream_reports_body_errors() {
        let chunks = vec![
            Ok(Bytes::from_static(b"[{\"id\": 1},")),
            Err(io::Error::other("connection reset")),
        ];
        let entities: Vec<_> = entity_stream(stream::iter(chunks)).collect().await;

        assert_eq!(entities.len(), 2);
        assert!(entities[0].is_ok());
        assert!(entities[1].is_err());
    }
}
