//! Transport abstraction and split functionality.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::codec::{ClientCodec, DeviceCodec, PendingLookup};
use crate::reader::DeviceReader;
use crate::version::ProtocolVersion;
use crate::writer::DeviceWriter;

/// A transport that can be split into separate read and write halves.
///
/// This abstracts over TCP and in-memory streams so the client and the device
/// endpoint can run over either.
pub trait DeviceTransport: Send + 'static {
    type Read: AsyncRead + Unpin + Send + 'static;
    type Write: AsyncWrite + Unpin + Send + 'static;

    fn into_split(self) -> (Self::Read, Self::Write);
}

impl DeviceTransport for TcpStream {
    type Read = OwnedReadHalf;
    type Write = OwnedWriteHalf;

    fn into_split(self) -> (Self::Read, Self::Write) {
        TcpStream::into_split(self)
    }
}

/// Split a transport into the client's reader and writer.
///
/// `pending` is consulted by the reader to decode each response according to
/// the command it answers.
pub fn split<T: DeviceTransport>(
    transport: T,
    pending: Arc<dyn PendingLookup>,
) -> (DeviceReader<T::Read>, DeviceWriter<T::Write>) {
    let (read, write) = transport.into_split();
    (
        DeviceReader::new(read, ClientCodec::new(pending.clone())),
        DeviceWriter::new(write, ClientCodec::new(pending)),
    )
}

/// Split a transport into the device's reader and writer, speaking `version`.
pub fn split_device<T: DeviceTransport>(
    transport: T,
    version: ProtocolVersion,
) -> (
    DeviceReader<T::Read, DeviceCodec>,
    DeviceWriter<T::Write, DeviceCodec>,
) {
    let (read, write) = transport.into_split();
    (
        DeviceReader::new(read, DeviceCodec::new(version)),
        DeviceWriter::new(write, DeviceCodec::new(version)),
    )
}
