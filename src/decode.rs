use std::io;

use actix_multipart::{Field, Multipart};
use actix_web::error::PayloadError;
use actix_web::http::header::HeaderMap;
use actix_web::web::Bytes;
use futures::channel::mpsc;
use futures::future;
use futures::stream::{self, LocalBoxStream};
use futures::{SinkExt, Stream, StreamExt, TryStreamExt};

use crate::config::Limits;

/// Chunked body of one uploaded file part.
pub type FileStream = LocalBoxStream<'static, io::Result<Bytes>>;

/// Per-part metadata for a plain field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub encoding: String,
    pub mime_type: String,
}

/// Per-part metadata for a file.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub file_name: String,
    pub encoding: String,
    pub mime_type: String,
}

/// One decode event, as emitted by [`decode_stream`] or any compatible
/// decoder front-end.
pub enum DecodeEvent {
    Field {
        name: String,
        value: String,
        info: FieldInfo,
    },
    File {
        field_name: String,
        content: FileStream,
        info: FileInfo,
    },
    PartsLimit,
    FilesLimit,
    FieldsLimit,
    Error(Box<dyn std::error::Error>),
    End,
}

/// Bound on in-flight chunks per file body; the decoder blocks on a full
/// channel, so an unread file stream applies backpressure upstream.
const FILE_CHANNEL_CAPACITY: usize = 8;

/// Drive the multipart decoder over `payload` and emit the decode events,
/// firing a limit event and stopping when a configured threshold would be
/// exceeded.
///
/// File bodies are handed out as bounded channel receivers; the stream keeps
/// pumping a file's bytes before advancing to the next part, so persistence
/// of one file interleaves with decoding of the rest.
pub fn decode_stream<S>(headers: &HeaderMap, payload: S, limits: Limits) -> LocalBoxStream<'static, DecodeEvent>
where
    S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
{
    // A transport that simply stops mid-part never surfaces an error from
    // the lower decoder, which keeps waiting for more bytes. Terminate the
    // payload with an incomplete-read error instead; a complete form stops
    // being polled at the close delimiter and never reaches it.
    let payload = payload.chain(stream::once(future::ready(Err(PayloadError::Incomplete(
        None,
    )))));
    let decoder = Decoder {
        multipart: Multipart::new(headers, payload),
        limits,
        parts: 0,
        fields: 0,
        files: 0,
        draining: None,
        done: false,
    };
    stream::unfold(decoder, |mut decoder| async move {
        decoder.next_event().await.map(|event| (event, decoder))
    })
    .boxed_local()
}

struct Decoder {
    multipart: Multipart,
    limits: Limits,
    parts: usize,
    fields: usize,
    files: usize,
    /// File part whose body is still being forwarded into its channel.
    draining: Option<(Field, mpsc::Sender<io::Result<Bytes>>)>,
    done: bool,
}

impl Decoder {
    async fn next_event(&mut self) -> Option<DecodeEvent> {
        if self.done {
            return None;
        }

        if let Some(event) = self.pump_draining().await {
            self.done = true;
            return Some(event);
        }

        loop {
            match self.multipart.try_next().await {
                Ok(Some(field)) => {
                    if let Some(event) = self.on_part(field).await {
                        return Some(event);
                    }
                    // Nameless part, skipped; move on to the next one.
                }
                Ok(None) => {
                    self.done = true;
                    return Some(DecodeEvent::End);
                }
                Err(err) => {
                    self.done = true;
                    return Some(DecodeEvent::Error(Box::new(err)));
                }
            }
        }
    }

    /// Forward the previous file part's remaining bytes into its channel.
    /// Returns an error event if the body itself fails to decode.
    async fn pump_draining(&mut self) -> Option<DecodeEvent> {
        let (mut field, mut tx) = self.draining.take()?;
        while let Some(chunk) = field.next().await {
            match chunk {
                // A dropped receiver is fine; keep consuming so the decoder
                // can advance past this part.
                Ok(bytes) => {
                    let _ = tx.send(Ok(bytes)).await;
                }
                Err(err) => {
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string())))
                        .await;
                    return Some(DecodeEvent::Error(Box::new(err)));
                }
            }
        }
        None
    }

    async fn on_part(&mut self, mut field: Field) -> Option<DecodeEvent> {
        let disposition = field.content_disposition().clone();

        let name = match disposition.get_name() {
            Some(name) => name.to_string(),
            None => {
                log::debug!("skipping nameless multipart part");
                drain_part(&mut field).await;
                return None;
            }
        };

        self.parts += 1;
        if exceeds(self.limits.parts, self.parts) {
            self.done = true;
            return Some(DecodeEvent::PartsLimit);
        }

        let encoding = transfer_encoding(&field);
        let mime_type = field.content_type().to_string();

        if let Some(file_name) = disposition.get_filename() {
            self.files += 1;
            if exceeds(self.limits.files, self.files) {
                self.done = true;
                return Some(DecodeEvent::FilesLimit);
            }

            let (tx, rx) = mpsc::channel(FILE_CHANNEL_CAPACITY);
            let info = FileInfo {
                file_name: file_name.to_string(),
                encoding,
                mime_type,
            };
            self.draining = Some((field, tx));
            Some(DecodeEvent::File {
                field_name: name,
                content: rx.boxed_local(),
                info,
            })
        } else {
            self.fields += 1;
            if exceeds(self.limits.fields, self.fields) {
                self.done = true;
                return Some(DecodeEvent::FieldsLimit);
            }

            let mut data = Vec::new();
            while let Some(chunk) = field.next().await {
                match chunk {
                    Ok(bytes) => data.extend_from_slice(&bytes),
                    Err(err) => {
                        self.done = true;
                        return Some(DecodeEvent::Error(Box::new(err)));
                    }
                }
            }
            Some(DecodeEvent::Field {
                name,
                value: String::from_utf8_lossy(&data).into_owned(),
                info: FieldInfo { encoding, mime_type },
            })
        }
    }
}

fn exceeds(limit: Option<usize>, count: usize) -> bool {
    limit.map_or(false, |limit| count > limit)
}

fn transfer_encoding(field: &Field) -> String {
    field
        .headers()
        .get("content-transfer-encoding")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("7bit")
        .to_string()
}

async fn drain_part(field: &mut Field) {
    while let Some(chunk) = field.next().await {
        if chunk.is_err() {
            break;
        }
    }
}
