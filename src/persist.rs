use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt, Cursor};
use futures::{FutureExt, StreamExt};

use crate::decode::{FileInfo, FileStream};
use crate::error::FormError;

/// Durable destination for uploaded file bytes. Writers and readers are
/// opened per storage key; whatever was written under a key must read back
/// byte-for-byte once the writer has been closed.
pub trait StorageSink: Clone + 'static {
    type Writer: AsyncWrite + Unpin + 'static;
    type Reader: AsyncRead + Unpin + 'static;

    /// Open a writer for a fresh object under `key`.
    fn create(&self, key: &str) -> LocalBoxFuture<'static, io::Result<Self::Writer>>;

    /// Re-open a previously written object for reading.
    fn open(&self, key: &str) -> LocalBoxFuture<'static, io::Result<Self::Reader>>;
}

/// A persisted file part: its metadata plus a handle reading back the
/// stored bytes.
pub struct FileDescriptor<R> {
    pub field_name: String,
    pub file_name: String,
    pub transfer_encoding: String,
    pub mime_type: String,
    pub content: R,
}

impl<R> fmt::Debug for FileDescriptor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("field_name", &self.field_name)
            .field("file_name", &self.file_name)
            .field("transfer_encoding", &self.transfer_encoding)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

static KEY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Storage keys must be unique per invocation so concurrent parts with
/// identical names cannot collide; a process-wide sequence number does.
fn storage_key(field_name: &str, file_name: &str) -> String {
    let seq = KEY_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{seq:08x}-{field_name}-{file_name}")
}

/// Drain one file part into the sink and produce its descriptor.
///
/// On any failure the rest of the source stream is still consumed before
/// returning, so the upstream decoder is never left stalled on an unread
/// body.
pub async fn persist_file<K: StorageSink>(
    sink: K,
    field_name: String,
    info: FileInfo,
    mut content: FileStream,
) -> Result<FileDescriptor<K::Reader>, FormError> {
    let key = storage_key(&field_name, &info.file_name);

    let mut writer = match sink.create(&key).await {
        Ok(writer) => writer,
        Err(err) => return Err(abandon(content, field_name, err).await),
    };

    while let Some(chunk) = content.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return Err(abandon(content, field_name, err).await),
        };
        if let Err(err) = writer.write_all(&chunk).await {
            return Err(abandon(content, field_name, err).await);
        }
    }

    writer
        .close()
        .await
        .map_err(|err| FormError::persistence(&field_name, err))?;
    let reader = sink
        .open(&key)
        .await
        .map_err(|err| FormError::persistence(&field_name, err))?;

    Ok(FileDescriptor {
        field_name,
        file_name: info.file_name,
        transfer_encoding: info.encoding,
        mime_type: info.mime_type,
        content: reader,
    })
}

async fn abandon(mut content: FileStream, field: String, err: io::Error) -> FormError {
    while content.next().await.is_some() {}
    FormError::persistence(field, err)
}

/// In-memory [`StorageSink`]. Objects become visible when their writer is
/// closed; the commit order is recorded for inspection.
#[derive(Clone, Default)]
pub struct MemorySink {
    store: Rc<RefCell<MemoryStore>>,
}

#[derive(Default)]
struct MemoryStore {
    objects: HashMap<String, Vec<u8>>,
    commits: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys in the order their writers were closed.
    pub fn commit_order(&self) -> Vec<String> {
        self.store.borrow().commits.clone()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.store.borrow().objects.get(key).cloned()
    }
}

impl StorageSink for MemorySink {
    type Writer = MemoryWriter;
    type Reader = Cursor<Vec<u8>>;

    fn create(&self, key: &str) -> LocalBoxFuture<'static, io::Result<MemoryWriter>> {
        let writer = MemoryWriter {
            store: Rc::clone(&self.store),
            key: key.to_string(),
            buf: Vec::new(),
        };
        futures::future::ready(Ok(writer)).boxed_local()
    }

    fn open(&self, key: &str) -> LocalBoxFuture<'static, io::Result<Cursor<Vec<u8>>>> {
        let result = self
            .store
            .borrow()
            .objects
            .get(key)
            .cloned()
            .map(Cursor::new)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no object {key:?}")));
        futures::future::ready(result).boxed_local()
    }
}

pub struct MemoryWriter {
    store: Rc<RefCell<MemoryStore>>,
    key: String,
    buf: Vec<u8>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let data = mem::take(&mut self.buf);
        let key = self.key.clone();
        let mut store = self.store.borrow_mut();
        store.objects.insert(key.clone(), data);
        store.commits.push(key);
        Poll::Ready(Ok(()))
    }
}
