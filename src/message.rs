//! The message shape shared by the input and output sides of a line handler.

use bytes::Bytes;

/// A single unit flowing through a line handler.
///
/// On the input side this is one physical line as produced by the upstream
/// reader. On the output side it is a transport-ready payload, possibly
/// aggregated from several physical lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The payload bytes.
    pub content: Bytes,
    /// Opaque severity tag, carried through unchanged.
    pub status: String,
    /// Opaque origin-supplied timestamp, carried through unchanged.
    pub timestamp: String,
    /// The number of source bytes this message consumed in the upstream
    /// reader, delimiter included. An aggregated output carries the sum over
    /// its contributing inputs, so the tailer can resume at the right byte
    /// after a restart.
    pub raw_data_len: usize,
}

impl Message {
    /// Creates a new `Message`.
    pub fn new(
        content: impl Into<Bytes>,
        status: impl Into<String>,
        timestamp: impl Into<String>,
        raw_data_len: usize,
    ) -> Self {
        Self {
            content: content.into(),
            status: status.into(),
            timestamp: timestamp.into(),
            raw_data_len,
        }
    }
}
