//! Message writer.
//!
//! [`DeviceWriter`] wraps a framed async writer and provides a [`Sink`] for
//! outgoing messages.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Sink;
use pin_project_lite::pin_project;
use tokio::io::AsyncWrite;
use tokio_util::codec::{Encoder, FramedWrite};

use crate::codec::ClientCodec;
use crate::error::CodecError;

pin_project! {
    /// An async sink for messages written to a debug connection.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use protocol::{DeviceWriter, Request, RequestBody};
    ///
    /// let mut writer = DeviceWriter::new(tcp_write_half, codec);
    /// writer.send(Request::new(1, RequestBody::Threads).into()).await?;
    /// ```
    pub struct DeviceWriter<W, C = ClientCodec> {
        #[pin]
        inner: FramedWrite<W, C>,
    }
}

impl<W, C> DeviceWriter<W, C>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, codec: C) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec),
        }
    }

    /// Feed, flush and await completion of one message.
    pub async fn send<I>(&mut self, msg: I) -> Result<(), CodecError>
    where
        C: Encoder<I, Error = CodecError> + Unpin,
    {
        use futures::SinkExt;
        SinkExt::send(&mut self.inner, msg).await
    }

    /// Shut down the write half. Every `send` has already flushed.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        use tokio::io::AsyncWriteExt;
        self.inner.get_mut().shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

impl<W, C, I> Sink<I> for DeviceWriter<W, C>
where
    W: AsyncWrite + Unpin,
    C: Encoder<I, Error = CodecError>,
{
    type Error = CodecError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        self.project().inner.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx)
    }
}
