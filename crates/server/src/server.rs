use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use protocol::testing::MemoryTransport;
use protocol::{
    Command, DeviceCodec, DeviceIncoming, DeviceOutgoing, DeviceReader, DeviceTransport,
    DeviceWriter, ErrorCode, HandshakeResponse, IoPortOpened, Request, Response, ResponseBody,
    Update, UpdateBody,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::plugins::ServerPlugin;

type Reader = DeviceReader<Box<dyn AsyncRead + Send + Unpin>, DeviceCodec>;
type Writer = DeviceWriter<Box<dyn AsyncWrite + Send + Unpin>, DeviceCodec>;

/// Listens for control connections on a TCP port.
pub struct DeviceListener {
    listener: TcpListener,
    config: ServerConfig,
}

impl DeviceListener {
    pub async fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!(addr = ?listener.local_addr().ok(), "listening for control connections");
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<DeviceServer, ServerError> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::debug!(%peer, "accepted control connection");
        Ok(DeviceServer::new(stream, self.config.clone()))
    }
}

/// The device end of one control connection.
///
/// Tests drive it step by step with [`DeviceServer::expect_request`] and
/// [`DeviceServer::respond`], or hand it to [`DeviceServer::serve`] with a
/// [`ServerPlugin`] that answers requests.
pub struct DeviceServer {
    config: ServerConfig,
    reader: Reader,
    writer: Writer,
    handshake_done: bool,
}

impl DeviceServer {
    pub fn new<T: DeviceTransport>(transport: T, config: ServerConfig) -> Self {
        let (read, write) = transport.into_split();
        let read: Box<dyn AsyncRead + Send + Unpin> = Box::new(read);
        let write: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write);
        Self {
            reader: DeviceReader::new(read, DeviceCodec::new(config.protocol_version)),
            writer: DeviceWriter::new(write, DeviceCodec::new(config.protocol_version)),
            handshake_done: false,
            config,
        }
    }

    /// A server over an in-memory transport, and the transport for the client.
    pub fn memory(config: ServerConfig) -> (Self, MemoryTransport) {
        let (client, device) = MemoryTransport::pair();
        (Self::new(device, config), client)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn next_message(&mut self) -> Result<DeviceIncoming, ServerError> {
        match self.reader.next().await {
            Some(message) => Ok(message?),
            None => Err(ServerError::Disconnected),
        }
    }

    async fn send(&mut self, message: DeviceOutgoing) -> Result<(), ServerError> {
        self.writer.send(message).await?;
        Ok(())
    }

    /// Wait for the client's handshake and answer it with the configured
    /// magic and version.
    pub async fn accept_handshake(&mut self) -> Result<(), ServerError> {
        match self.next_message().await? {
            DeviceIncoming::Handshake(request) => {
                tracing::debug!(magic = %request.magic, "received handshake");
            }
            DeviceIncoming::Request(request) => {
                return Err(ServerError::UnexpectedMessage {
                    expected: "handshake",
                    received: format!("{} request", request.command()),
                });
            }
        }
        let version = self.config.protocol_version;
        let response = HandshakeResponse {
            magic: self.config.magic.clone(),
            protocol_version: version,
            revision_timestamp: version
                .has_packet_length()
                .then_some(self.config.revision_timestamp),
        };
        tracing::debug!(%version, "sending handshake response");
        self.send(DeviceOutgoing::Handshake(response)).await?;
        self.handshake_done = true;
        Ok(())
    }

    /// Read the next request.
    pub async fn expect_request(&mut self) -> Result<Request, ServerError> {
        match self.next_message().await? {
            DeviceIncoming::Request(request) => {
                tracing::debug!(request_id = request.request_id, command = %request.command(), "received request");
                Ok(request)
            }
            DeviceIncoming::Handshake(_) => Err(ServerError::UnexpectedMessage {
                expected: "request",
                received: "handshake".to_string(),
            }),
        }
    }

    /// Read the next request and check that it is a `command` request.
    pub async fn expect_command(&mut self, command: Command) -> Result<Request, ServerError> {
        let request = self.expect_request().await?;
        if request.command() != command {
            return Err(ServerError::UnexpectedCommand {
                expected: command,
                received: request.command(),
            });
        }
        Ok(request)
    }

    pub async fn respond(&mut self, response: Response) -> Result<(), ServerError> {
        tracing::debug!(request_id = response.request_id, error_code = %response.error_code, "sending response");
        self.send(DeviceOutgoing::Response(response)).await
    }

    pub async fn send_update(&mut self, update: Update) -> Result<(), ServerError> {
        tracing::debug!(update_type = ?update.update_type(), "sending update");
        self.send(DeviceOutgoing::Update(update)).await
    }

    /// Listen on an ephemeral local port for program output and tell the
    /// client about it.
    pub async fn open_io_port(&mut self) -> Result<IoPort, ServerError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        self.send_update(Update::new(UpdateBody::IoPortOpened(IoPortOpened {
            port: u32::from(port),
        })))
        .await?;
        Ok(IoPort { listener })
    }

    /// Answer requests until the client exits the channel or disconnects,
    /// accepting the handshake first if that has not happened yet.
    ///
    /// Plugins are asked in order for a response; the first answer wins.
    /// `ExitChannel` is acknowledged when no plugin answers it, and any other
    /// unanswered request gets `UndefinedCommand`.
    pub async fn serve(mut self, plugins: Vec<Arc<dyn ServerPlugin>>) -> Result<(), ServerError> {
        if !self.handshake_done {
            self.accept_handshake().await?;
        }
        loop {
            let request = match self.expect_request().await {
                Ok(request) => request,
                Err(ServerError::Disconnected) => {
                    tracing::debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let command = request.command();
            let response = plugins
                .iter()
                .find_map(|p| p.provide_response(&request))
                .unwrap_or_else(|| match command {
                    Command::ExitChannel => Response::ok(request.request_id, ResponseBody::Empty),
                    _ => Response::error(request.request_id, ErrorCode::UndefinedCommand),
                });
            self.respond(response).await?;

            let updates: Vec<Update> = plugins
                .iter()
                .flat_map(|p| p.updates_after(&request))
                .collect();
            for update in updates {
                self.send_update(update).await?;
            }

            if command == Command::ExitChannel {
                tracing::debug!("client exited the channel");
                return Ok(());
            }
        }
    }
}

/// A listening IO port announced to the client.
pub struct IoPort {
    listener: TcpListener,
}

impl IoPort {
    pub fn port(&self) -> Result<u16, ServerError> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn accept(self) -> Result<IoChannel, ServerError> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::debug!(%peer, "IO port connected");
        Ok(IoChannel { stream })
    }
}

/// Program output written to a connected client.
pub struct IoChannel {
    stream: TcpStream,
}

impl IoChannel {
    /// Write raw text; lines are split wherever the client sees `\n`.
    pub async fn write(&mut self, text: &str) -> Result<(), ServerError> {
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), ServerError> {
        self.write(&format!("{line}\n")).await
    }
}
