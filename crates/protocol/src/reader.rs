//! Message reader.
//!
//! [`DeviceReader`] wraps a framed async reader and yields a stream of decoded
//! messages. The codec decides which side of the connection it reads.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

use crate::codec::ClientCodec;
use crate::error::CodecError;

pin_project! {
    /// An async stream of messages read from a debug connection.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use futures::StreamExt;
    /// use protocol::{ClientCodec, DeviceReader, Incoming};
    ///
    /// let mut reader = DeviceReader::new(tcp_read_half, ClientCodec::new(pending));
    ///
    /// while let Some(result) = reader.next().await {
    ///     match result? {
    ///         Incoming::Handshake(h) => { /* verify magic */ }
    ///         Incoming::Response(r) => { /* resolve pending request */ }
    ///         Incoming::Update(u) => { /* dispatch */ }
    ///         Incoming::Undecodable { request_id, .. } => { /* fail the request */ }
    ///     }
    /// }
    /// ```
    pub struct DeviceReader<R, C = ClientCodec> {
        #[pin]
        inner: FramedRead<R, C>,
    }
}

impl<R, C> DeviceReader<R, C>
where
    R: AsyncRead + Unpin,
    C: Decoder,
{
    pub fn new(reader: R, codec: C) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
        }
    }

    pub fn codec(&self) -> &C {
        self.inner.decoder()
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R, C> Stream for DeviceReader<R, C>
where
    R: AsyncRead + Unpin,
    C: Decoder<Error = CodecError>,
{
    type Item = Result<C::Item, CodecError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}
