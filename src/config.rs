use serde::Deserialize;

use crate::decode::{FileInfo, FileStream};

/// Part-count thresholds forwarded to the decoder. A `None` limit is
/// unlimited; exceeding a configured limit rejects the whole form with a
/// 413-style error.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub fields: Option<usize>,
    pub files: Option<usize>,
    pub parts: Option<usize>,
}

/// Caller-supplied per-file handler. When present it receives each file
/// part's stream directly and no persistence task is spawned; the handler
/// must consume the stream promptly, since the decoder applies backpressure
/// through it.
pub type FileHandler = Box<dyn FnMut(&str, FileStream, &FileInfo)>;

/// Options for one form aggregation, built around the storage sink.
pub struct AcceptOptions<K> {
    pub limits: Limits,
    pub sink: K,
    pub on_file: Option<FileHandler>,
}

impl<K> AcceptOptions<K> {
    pub fn new(sink: K) -> Self {
        Self {
            limits: Limits::default(),
            sink,
            on_file: None,
        }
    }

    pub fn set_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn set_on_file<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str, FileStream, &FileInfo) + 'static,
    {
        self.on_file = Some(Box::new(handler));
        self
    }
}
