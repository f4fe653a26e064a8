use std::fmt;
use std::io;

use actix_web::error::PayloadError;
use actix_web::http::header::HeaderMap;
use actix_web::web::Bytes;
use futures::future::LocalBoxFuture;
use futures::stream::FuturesOrdered;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::{Map, Value};

use crate::config::AcceptOptions;
use crate::decode::{decode_stream, DecodeEvent};
use crate::error::{FormError, LimitKind};
use crate::fields::FieldAccumulator;
use crate::persist::{persist_file, FileDescriptor, StorageSink};

/// The single terminal value of one form aggregation.
pub struct FormResult<R> {
    pub fields: Map<String, Value>,
    /// Persisted files, ordered by submission, not by completion. Empty when
    /// a custom file handler was supplied.
    pub files: Vec<FileDescriptor<R>>,
}

impl<R> fmt::Debug for FormResult<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormResult")
            .field("fields", &self.fields)
            .field("files", &self.files)
            .finish()
    }
}

/// Consume a stream of decode events and settle exactly once.
///
/// Field events mutate the accumulator synchronously; each file event
/// spawns a persistence future (unless `on_file` bypasses persistence),
/// collected in submission order. Persistence interleaves with continued
/// event delivery; the only join point is draining the collected futures
/// after `End`. The first limit, decode error, persistence failure, or
/// premature end of the event stream wins, and futures still outstanding at
/// rejection are dropped with their outcomes discarded.
pub async fn aggregate<S, K>(
    events: S,
    mut options: AcceptOptions<K>,
) -> Result<FormResult<K::Reader>, FormError>
where
    S: Stream<Item = DecodeEvent> + Unpin,
    K: StorageSink,
{
    let mut events = events.fuse();
    let mut fields = FieldAccumulator::new();
    let mut pending: FuturesOrdered<
        LocalBoxFuture<'static, Result<FileDescriptor<K::Reader>, FormError>>,
    > = FuturesOrdered::new();
    let mut files = Vec::new();

    loop {
        futures::select! {
            event = events.next() => match event {
                Some(DecodeEvent::Field { name, value, .. }) => {
                    fields.insert(&name, value)?;
                }
                Some(DecodeEvent::File { field_name, content, info }) => {
                    if let Some(handler) = options.on_file.as_mut() {
                        handler(&field_name, content, &info);
                    } else {
                        let sink = options.sink.clone();
                        pending.push_back(
                            persist_file(sink, field_name, info, content).boxed_local(),
                        );
                    }
                }
                Some(DecodeEvent::PartsLimit) => {
                    return Err(FormError::limit(LimitKind::Parts));
                }
                Some(DecodeEvent::FilesLimit) => {
                    return Err(FormError::limit(LimitKind::Files));
                }
                Some(DecodeEvent::FieldsLimit) => {
                    return Err(FormError::limit(LimitKind::Fields));
                }
                Some(DecodeEvent::Error(err)) => {
                    return Err(FormError::Decode(err));
                }
                Some(DecodeEvent::End) => break,
                // Transport closed before the decoder signalled completion.
                None => {
                    return Err(FormError::decode(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "decode stream closed before end of form",
                    )));
                }
            },
            descriptor = pending.select_next_some() => files.push(descriptor?),
        }
    }

    while let Some(descriptor) = pending.next().await {
        files.push(descriptor?);
    }

    Ok(FormResult {
        fields: fields.into_map(),
        files,
    })
}

/// Decode and aggregate one request: the request-level entry point.
pub async fn accept_form<S, K>(
    headers: &HeaderMap,
    payload: S,
    options: AcceptOptions<K>,
) -> Result<FormResult<K::Reader>, FormError>
where
    S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
    K: StorageSink,
{
    let events = decode_stream(headers, payload, options.limits);
    aggregate(events, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::rc::Rc;
    use std::task::{Context, Poll};

    use futures::executor::block_on;
    use futures::io::AsyncReadExt;
    use futures::stream;
    use serde_json::json;

    use crate::decode::{FieldInfo, FileInfo, FileStream};
    use crate::persist::MemorySink;

    fn field(name: &str, value: &str) -> DecodeEvent {
        DecodeEvent::Field {
            name: name.to_string(),
            value: value.to_string(),
            info: FieldInfo {
                encoding: "7bit".to_string(),
                mime_type: "text/plain".to_string(),
            },
        }
    }

    fn file(field_name: &str, file_name: &str, content: FileStream) -> DecodeEvent {
        DecodeEvent::File {
            field_name: field_name.to_string(),
            content,
            info: FileInfo {
                file_name: file_name.to_string(),
                encoding: "7bit".to_string(),
                mime_type: "application/octet-stream".to_string(),
            },
        }
    }

    fn bytes_stream(parts: &[&str]) -> FileStream {
        let items: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|part| Ok(Bytes::copy_from_slice(part.as_bytes())))
            .collect();
        stream::iter(items).boxed_local()
    }

    fn run(
        events: Vec<DecodeEvent>,
        options: AcceptOptions<MemorySink>,
    ) -> Result<FormResult<futures::io::Cursor<Vec<u8>>>, FormError> {
        block_on(aggregate(stream::iter(events), options))
    }

    /// Withholds its chunks until some other file has been committed to the
    /// sink, forcing this upload to finish last.
    struct SlowStream {
        chunks: VecDeque<Bytes>,
        sink: MemorySink,
        wait_for: String,
    }

    impl Stream for SlowStream {
        type Item = io::Result<Bytes>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let this = self.get_mut();
            let unblocked = this
                .sink
                .commit_order()
                .iter()
                .any(|key| key.contains(&this.wait_for));
            if !unblocked {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Poll::Ready(this.chunks.pop_front().map(Ok))
        }
    }

    #[test]
    fn resolves_fields_and_files() {
        let sink = MemorySink::new();
        let events = vec![
            field("title", "hello"),
            field("someCollection[0][foo]", "foo"),
            file("doc", "a.txt", bytes_stream(&["file ", "bytes"])),
            DecodeEvent::End,
        ];

        let result = run(events, AcceptOptions::new(sink)).unwrap();
        assert_eq!(
            Value::Object(result.fields),
            json!({"title": "hello", "someCollection": [{"foo": "foo"}]})
        );
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].field_name, "doc");
        assert_eq!(result.files[0].file_name, "a.txt");

        let mut buf = Vec::new();
        let mut content = result.files.into_iter().next().unwrap().content;
        block_on(content.read_to_end(&mut buf)).unwrap();
        assert_eq!(buf, b"file bytes");
    }

    #[test]
    fn file_order_follows_submission_not_completion() {
        let sink = MemorySink::new();
        let slow = SlowStream {
            chunks: vec![Bytes::from_static(b"slow file")].into(),
            sink: sink.clone(),
            wait_for: "fast.dat".to_string(),
        };
        let events = vec![
            file("first", "slow.dat", slow.boxed_local()),
            file("second", "fast.dat", bytes_stream(&["fast"])),
            DecodeEvent::End,
        ];

        let result = run(events, AcceptOptions::new(sink.clone())).unwrap();

        // The fast file finished persisting first...
        let commits = sink.commit_order();
        assert_eq!(commits.len(), 2);
        assert!(commits[0].contains("fast.dat"));
        assert!(commits[1].contains("slow.dat"));

        // ...but the result preserves submission order.
        assert_eq!(result.files[0].field_name, "first");
        assert_eq!(result.files[1].field_name, "second");
    }

    #[test]
    fn limit_event_rejects_with_413() {
        let sink = MemorySink::new();
        let events = vec![
            field("a", "1"),
            file("doc", "a.txt", bytes_stream(&["bytes"])),
            DecodeEvent::FilesLimit,
        ];

        let err = run(events, AcceptOptions::new(sink)).unwrap_err();
        assert!(matches!(
            err,
            FormError::LimitExceeded {
                kind: LimitKind::Files
            }
        ));
        assert_eq!(err.status().as_u16(), 413);
    }

    #[test]
    fn decode_error_rejects() {
        let sink = MemorySink::new();
        let failure = io::Error::new(io::ErrorKind::InvalidData, "bad boundary");
        let events = vec![field("a", "1"), DecodeEvent::Error(Box::new(failure))];

        let err = run(events, AcceptOptions::new(sink)).unwrap_err();
        assert!(matches!(err, FormError::Decode(_)));
    }

    #[test]
    fn stream_closing_before_end_rejects() {
        let sink = MemorySink::new();
        let events = vec![field("a", "1")];

        let err = run(events, AcceptOptions::new(sink)).unwrap_err();
        assert!(matches!(err, FormError::Decode(_)));
    }

    #[test]
    fn persistence_failure_discards_fields() {
        let sink = MemorySink::new();
        let broken = stream::iter(vec![Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "body lost",
        ))])
        .boxed_local();
        let events = vec![
            field("a", "1"),
            file("doc", "a.txt", broken),
            DecodeEvent::End,
        ];

        let err = run(events, AcceptOptions::new(sink)).unwrap_err();
        assert!(matches!(err, FormError::Persistence { .. }));
    }

    #[test]
    fn custom_handler_bypasses_persistence() {
        let sink = MemorySink::new();
        let received: Rc<RefCell<Vec<(String, FileStream)>>> = Rc::new(RefCell::new(Vec::new()));
        let handler_streams = Rc::clone(&received);

        let events = vec![
            field("a", "1"),
            file("doc", "a.txt", bytes_stream(&["custom ", "bytes"])),
            DecodeEvent::End,
        ];
        let options = AcceptOptions::new(sink.clone()).set_on_file(move |name, stream, _info| {
            handler_streams
                .borrow_mut()
                .push((name.to_string(), stream));
        });

        let result = run(events, options).unwrap();
        assert_eq!(Value::Object(result.fields), json!({"a": "1"}));
        assert!(result.files.is_empty());
        // Nothing reached the sink.
        assert!(sink.commit_order().is_empty());

        let mut received = received.borrow_mut();
        assert_eq!(received.len(), 1);
        let (name, stream) = received.pop().unwrap();
        assert_eq!(name, "doc");
        let chunks: Vec<io::Result<Bytes>> = block_on(stream.collect());
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(body, b"custom bytes");
    }

    #[test]
    fn invalid_field_name_rejects() {
        let sink = MemorySink::new();
        let events = vec![field("[broken]", "1"), DecodeEvent::End];

        let err = run(events, AcceptOptions::new(sink)).unwrap_err();
        assert!(matches!(err, FormError::InvalidFieldName(_)));
    }
}
