//! Program output read from the device's IO port.

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::events::{ClientEvent, EventBus};

/// Output longer than this without a newline is forwarded in pieces.
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Connect to the IO port and forward each line of output as an event.
pub(crate) fn spawn(
    host: String,
    port: u16,
    events: EventBus,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            stream = TcpStream::connect((host.as_str(), port)) => stream,
        };
        match stream {
            Ok(stream) => {
                tracing::debug!(%host, port, "connected to IO port");
                forward_lines(stream, events, cancel).await;
            }
            Err(e) => tracing::warn!(error = %e, %host, port, "failed to connect to IO port"),
        }
    })
}

/// Read newline-delimited text until EOF or cancellation. A trailing partial
/// line is emitted when the stream ends.
pub(crate) async fn forward_lines<R>(reader: R, events: EventBus, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, OutputLines::new(MAX_LINE_LENGTH));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("IO port reader cancelled");
                break;
            }
            line = lines.next() => match line {
                Some(Ok(line)) => events.emit(ClientEvent::IoOutput(line)),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "IO port read failed");
                    break;
                }
                None => {
                    tracing::debug!("IO port closed");
                    break;
                }
            }
        }
    }
}

/// Splits program output into lines.
///
/// Output is not required to be UTF-8: invalid sequences are replaced, never
/// rejected. A trailing `\r` is dropped.
#[derive(Debug)]
struct OutputLines {
    max_length: usize,
    /// Bytes before this index are known to hold no newline.
    next_index: usize,
}

impl OutputLines {
    fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Decoder for OutputLines {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        let end = src.len().min(self.max_length);
        if let Some(offset) = src[self.next_index..end].iter().position(|b| *b == b'\n') {
            let newline = self.next_index + offset;
            self.next_index = 0;
            let line = src.split_to(newline + 1);
            return Ok(Some(output_text(&line[..newline])));
        }
        if src.len() >= self.max_length {
            self.next_index = 0;
            let chunk = src.split_to(self.max_length);
            return Ok(Some(output_text(&chunk)));
        }
        self.next_index = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(output_text(&rest)))
    }
}

fn output_text(bytes: &[u8]) -> String {
    let line = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn partial_lines_are_reassembled() {
        let (mut device, client) = tokio::io::duplex(4);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let task = tokio::spawn(forward_lines(client, events, CancellationToken::new()));

        for chunk in ["hel", "lo\nwor", "ld\r\n", "tail"] {
            device.write_all(chunk.as_bytes()).await.unwrap();
        }
        drop(device);
        task.await.unwrap();

        assert_eq!(rx.recv().await, Some(ClientEvent::IoOutput("hello".into())));
        assert_eq!(rx.recv().await, Some(ClientEvent::IoOutput("world".into())));
        assert_eq!(rx.recv().await, Some(ClientEvent::IoOutput("tail".into())));
    }

    #[tokio::test]
    async fn cancellation_stops_the_reader() {
        let (_device, client) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_lines(client, EventBus::new(), cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_output() {
        let (mut device, client) = tokio::io::duplex(64);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let task = tokio::spawn(forward_lines(client, events, CancellationToken::new()));

        device.write_all(b"caf\xe9\nnext line\nlast\n").await.unwrap();
        drop(device);
        task.await.unwrap();

        assert_eq!(rx.recv().await, Some(ClientEvent::IoOutput("caf\u{fffd}".into())));
        assert_eq!(rx.recv().await, Some(ClientEvent::IoOutput("next line".into())));
        assert_eq!(rx.recv().await, Some(ClientEvent::IoOutput("last".into())));
    }

    #[test]
    fn long_lines_are_split() {
        let mut codec = OutputLines::new(4);
        let mut buf = BytesMut::from(&b"abcdefg"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("abcd".into()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\nxy");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("efg".into()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("xy".into()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
