//! `COPY IN`/`COPY OUT` plumbing. `COPY IN` bytes are
//! queued as `CopyData`/`CopyDone` frames alongside the rest of a pipeline's
//! write phase; `COPY OUT`/`COPY BOTH` bytes are drained by the read loop
//! into whatever sink the caller supplied.

use std::pin::Pin;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{PgError, PgResult};
use crate::message::FrontendMessage;

/// Chunk size for splitting a large `COPY IN` payload across multiple
/// `CopyData` messages rather than one unbounded frame.
const CHUNK_SIZE: usize = 64 * 1024;

/// `COPY ... FROM STDIN` input. `None` sends nothing (the common case: most
/// queries aren't `COPY FROM STDIN` and the server never asks for data).
pub enum CopyInSource {
    None,
    Bytes(Vec<u8>),
}

/// Queues `CopyData`/`CopyDone` for `source` onto `outbound`, consuming it.
/// A no-op for [`CopyInSource::None`].
pub async fn write_copy_in(outbound: &mpsc::UnboundedSender<BytesMut>, source: &mut CopyInSource) -> PgResult<()> {
    let data = match std::mem::replace(source, CopyInSource::None) {
        CopyInSource::None => return Ok(()),
        CopyInSource::Bytes(data) => data,
    };
    for chunk in data.chunks(CHUNK_SIZE.max(1)) {
        outbound.send(FrontendMessage::CopyData { data: chunk.to_vec() }.encode()).map_err(|_| PgError::Closed)?;
    }
    outbound.send(FrontendMessage::CopyDone.encode()).map_err(|_| PgError::Closed)?;
    Ok(())
}

/// `COPY ... TO STDOUT`/`COPY BOTH` output sink. `None` discards the bytes
/// (the default when a caller doesn't care about `COPY OUT` output);
/// `Buffer` accumulates them for later inspection; `Writer` streams them
/// into any `AsyncWrite`.
pub enum CopySink {
    None,
    Buffer(Vec<u8>),
    Writer(Pin<Box<dyn AsyncWrite + Send>>),
}

impl CopySink {
    pub fn buffer() -> Self {
        CopySink::Buffer(Vec::new())
    }

    pub fn writer(w: impl AsyncWrite + Send + 'static) -> Self {
        CopySink::Writer(Box::pin(w))
    }

    pub async fn write(&mut self, data: &[u8]) -> PgResult<()> {
        match self {
            CopySink::None => Ok(()),
            CopySink::Buffer(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            CopySink::Writer(w) => w.as_mut().write_all(data).await.map_err(PgError::from),
        }
    }

    /// The accumulated bytes if this is a [`CopySink::Buffer`]; empty
    /// otherwise.
    pub fn into_buffer(self) -> Vec<u8> {
        match self {
            CopySink::Buffer(v) => v,
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_copy_in_sends_data_then_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = CopyInSource::Bytes(b"field a\tfield b\tfield c".to_vec());
        write_copy_in(&tx, &mut source).await.unwrap();
        drop(tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first[0], b'd');
        let second = rx.recv().await.unwrap();
        assert_eq!(second[0], b'c');
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_copy_in_none_sends_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = CopyInSource::None;
        write_copy_in(&tx, &mut source).await.unwrap();
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn buffer_sink_accumulates_writes() {
        let mut sink = CopySink::buffer();
        sink.write(b"field a\t").await.unwrap();
        sink.write(b"field b\n").await.unwrap();
        assert_eq!(sink.into_buffer(), b"field a\tfield b\n");
    }
}
