//! The debug protocol client.
//!
//! A connected client runs two tasks. The reader task decodes the control
//! socket and resolves responses directly against the pending request map.
//! Handshake responses and updates are forwarded to the processor task, which
//! handles them one at a time; because responses never wait behind the update
//! queue, an update handler can itself send requests and await them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::StreamExt;
use protocol::{
    AddBreakpointsRequest, AddConditionalBreakpointsRequest, BreakpointLocation, ClientCodec,
    Command, ConditionalBreakpointLocation, DEBUGGER_MAGIC, DeviceReader, DeviceTransport,
    DeviceWriter, ExecuteRequest, HANDSHAKE_REQUEST_ID, HandshakeRequest, HandshakeResponse,
    Incoming, Outgoing, PendingLookup, ProtocolVersion, RemoveBreakpointsRequest, Request,
    RequestBody, Response, ResponseBody, SUPPORTED_MAX, SUPPORTED_MIN, StackTraceRequest,
    StepRequest, StepType, StopReason, UPDATE_REQUEST_ID, Update, UpdateBody, VariableType,
    VariablesRequest, VariablesResponse, VersionSupport,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breakpoints::{BreakpointManager, BreakpointRequests, BreakpointTarget, SyncReport};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{ClientEvent, EventBus, EventKind, EventReceiver};
use crate::io_port;
use crate::pending_requests::{PendingRequests, Reply};
use crate::plugins::{HookPoint, PluginManager};
use crate::state::{ExecutionState, SessionState, ShutdownReason};
use crate::variables::{self, Synthesis};

type ControlReader = DeviceReader<Box<dyn AsyncRead + Send + Unpin>>;
type ControlWriter = DeviceWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Client for one debug session with a device.
pub struct DebugProtocolClient {
    session: Arc<Session>,

    // Task handles for cleanup
    reader_handle: Option<JoinHandle<()>>,
    processor_handle: Option<JoinHandle<()>>,
}

impl DebugProtocolClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            session: Arc::new(Session::new(config)),
            reader_handle: None,
            processor_handle: None,
        }
    }

    /// Open the control socket, retrying on a fixed interval until the device
    /// accepts or the client is shut down.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let session = &self.session;
        session.set_state(SessionState::Connecting);
        let (host, port) = session.config.control_address();
        let mut delays = retry::delay::Fixed::from_millis(session.config.connect_retry_interval_ms);

        let stream = loop {
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => break stream,
                Err(e) => {
                    let delay = delays
                        .next()
                        .unwrap_or_else(|| session.config.connect_retry_interval());
                    tracing::debug!(error = %e, %host, port, ?delay, "control port not ready, retrying");
                    tokio::select! {
                        _ = session.cancel.cancelled() => return Err(ClientError::ShuttingDown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };
        tracing::info!(%host, port, "connected to control port");
        self.connect_transport(stream).await
    }

    /// Start a session over an already open transport.
    pub async fn connect_transport<T: DeviceTransport>(
        &mut self,
        transport: T,
    ) -> Result<(), ClientError> {
        let session = self.session.clone();
        if session.session_state().is_terminal() {
            return Err(ClientError::ShuttingDown);
        }

        let (read, write) = transport.into_split();
        let pending: Arc<dyn PendingLookup> = session.pending.clone();
        let read: Box<dyn AsyncRead + Send + Unpin> = Box::new(read);
        let write: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write);
        let reader: ControlReader = DeviceReader::new(read, ClientCodec::new(pending.clone()));
        let writer: ControlWriter = DeviceWriter::new(write, ClientCodec::new(pending));
        *session.writer.lock().await = Some(writer);

        session.set_state(SessionState::HandshakePending);
        session.events.emit(ClientEvent::Connected);
        session
            .plugins
            .dispatch(HookPoint::OnServerConnected, |p| p.on_server_connected());

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        self.reader_handle = Some(Self::spawn_reader_task(session.clone(), reader, message_tx));
        self.processor_handle = Some(Self::spawn_processor_task(session.clone(), message_rx));

        if session.config.auto_handshake {
            session.handshake().await?;
        }
        Ok(())
    }

    /// Send the handshake and wait for it to be verified.
    pub async fn handshake(&self) -> Result<ProtocolVersion, ClientError> {
        self.session.handshake().await
    }

    /// Spawn the reader task that reads messages from the control socket
    fn spawn_reader_task(
        session: Arc<Session>,
        mut reader: ControlReader,
        message_tx: mpsc::UnboundedSender<Incoming>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let cancel = session.cancel.clone();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("reader task cancelled");
                        break;
                    }
                    msg = reader.next() => {
                        match msg {
                            Some(Ok(Incoming::Response(response))) => session.resolve_response(response),
                            Some(Ok(Incoming::Undecodable { request_id, error })) => {
                                session.pending.reject(request_id, ClientError::UndecodableResponse { request_id, error });
                            }
                            Some(Ok(message)) => {
                                if message_tx.send(message).is_err() {
                                    tracing::debug!("message channel closed");
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                tracing::error!(error = %e, "transport error");
                                session.connection_lost();
                                break;
                            }
                            None => {
                                tracing::debug!("control socket closed");
                                session.connection_lost();
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Spawn the processor task that handles handshake responses and updates
    fn spawn_processor_task(
        session: Arc<Session>,
        mut message_rx: mpsc::UnboundedReceiver<Incoming>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let cancel = session.cancel.clone();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("processor task cancelled");
                        break;
                    }
                    msg = message_rx.recv() => {
                        match msg {
                            Some(Incoming::Handshake(handshake)) => session.handle_handshake(handshake).await,
                            Some(Incoming::Update(update)) => session.handle_update(update).await,
                            Some(Incoming::Response(response)) => session.resolve_response(response),
                            Some(Incoming::Undecodable { request_id, error }) => {
                                session.pending.reject(request_id, ClientError::UndecodableResponse { request_id, error });
                            }
                            None => {
                                tracing::debug!("message channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.session.events.subscribe()
    }

    /// Resolve with the next event of `kind`.
    pub fn once(&self, kind: EventKind) -> oneshot::Receiver<ClientEvent> {
        self.session.events.once(kind)
    }

    pub fn events(&self) -> &EventBus {
        &self.session.events
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.session.plugins
    }

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.session.breakpoints
    }

    pub fn config(&self) -> &ClientConfig {
        &self.session.config
    }

    /// Negotiated protocol version; `None` until the handshake is verified.
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.session.version.get().copied()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.session_state()
    }

    pub fn execution_state(&self) -> ExecutionState {
        *self.session.execution()
    }

    pub fn is_stopped(&self) -> bool {
        self.session.execution().is_stopped
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.session.pending.len()
    }

    /// Send a raw request and wait for its response.
    pub async fn send_request(&self, body: RequestBody) -> Result<Response, ClientError> {
        self.session.send_request(body).await
    }

    pub async fn continue_(&self) -> Result<Response, ClientError> {
        self.session.continue_().await
    }

    /// Pause the program. Unless `force` is set, fails when it is already
    /// stopped.
    pub async fn pause(&self, force: bool) -> Result<Response, ClientError> {
        self.session.pause(force).await
    }

    pub async fn step(&self, step_type: StepType) -> Result<Response, ClientError> {
        self.session.step(step_type).await
    }

    pub async fn step_in(&self) -> Result<Response, ClientError> {
        self.session.step(StepType::Line).await
    }

    pub async fn step_over(&self) -> Result<Response, ClientError> {
        self.session.step(StepType::Over).await
    }

    pub async fn step_out(&self) -> Result<Response, ClientError> {
        self.session.step(StepType::Out).await
    }

    pub async fn threads(&self) -> Result<Response, ClientError> {
        self.session.threads().await
    }

    pub async fn stack_trace(&self, thread_index: i32) -> Result<Response, ClientError> {
        self.session.stack_trace(thread_index).await
    }

    /// Look up the variable at `path`.
    ///
    /// Path segments wrapped in double quotes are matched case-sensitively.
    /// Lookups that fail part way along the path may resolve to a
    /// synthesized variable, or to [`ClientError::VariableLookup`].
    pub async fn variables<S: AsRef<str> + Sync>(
        &self,
        thread_index: i32,
        stack_frame_index: u32,
        path: &[S],
        get_child_keys: bool,
    ) -> Result<Response, ClientError> {
        self.session
            .variables(thread_index, stack_frame_index, path, get_child_keys)
            .await
    }

    pub async fn execute(
        &self,
        thread_index: i32,
        stack_frame_index: u32,
        source_code: &str,
    ) -> Result<Response, ClientError> {
        self.session
            .execute(thread_index, stack_frame_index, source_code)
            .await
    }

    pub async fn add_breakpoints(
        &self,
        breakpoints: Vec<BreakpointTarget>,
    ) -> Result<Response, ClientError> {
        self.session.add_breakpoints(breakpoints).await
    }

    pub async fn remove_breakpoints(&self, breakpoint_ids: Vec<u32>) -> Result<Response, ClientError> {
        self.session.remove_breakpoints(breakpoint_ids).await
    }

    pub async fn list_breakpoints(&self) -> Result<Response, ClientError> {
        self.session.send_request(RequestBody::ListBreakpoints).await
    }

    /// Push breakpoint changes to the device.
    pub async fn sync_breakpoints(&self) -> Result<SyncReport, ClientError> {
        self.session.sync_breakpoints().await
    }

    /// End the session: ask the device to close the channel, then close the
    /// sockets. Calling it again returns the reason the session ended with.
    pub async fn shutdown(&mut self) -> ShutdownReason {
        let reason = self
            .session
            .shutdown(ShutdownReason::UserRequest, false)
            .await;
        self.join_tasks().await;
        reason
    }

    /// End the session without waiting on the device.
    pub async fn shutdown_now(&mut self) -> ShutdownReason {
        let reason = self
            .session
            .shutdown(ShutdownReason::UserRequest, true)
            .await;
        self.join_tasks().await;
        reason
    }

    async fn join_tasks(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.processor_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for DebugProtocolClient {
    fn drop(&mut self) {
        self.session.cancel.cancel();
    }
}

/// State shared by the client handle and its tasks.
struct Session {
    config: ClientConfig,
    writer: tokio::sync::Mutex<Option<ControlWriter>>,
    pending: Arc<PendingRequests>,
    next_request_id: AtomicU32,
    version: OnceLock<ProtocolVersion>,
    state: Mutex<SessionState>,
    execution: Mutex<ExecutionState>,
    seen_first_stop: AtomicBool,
    breakpoint_sync_deferred: AtomicBool,
    events: EventBus,
    plugins: PluginManager,
    breakpoints: BreakpointManager,
    cancel: CancellationToken,
    /// Cancels writes in progress so an immediate shutdown can drop the writer.
    write_cancel: CancellationToken,
    io_cancel: CancellationToken,
    io_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: OnceCell<ShutdownReason>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    fn new(config: ClientConfig) -> Self {
        let events = EventBus::new();
        let cancel = CancellationToken::new();
        Self {
            config,
            writer: tokio::sync::Mutex::new(None),
            pending: Arc::new(PendingRequests::new()),
            next_request_id: AtomicU32::new(1),
            version: OnceLock::new(),
            state: Mutex::new(SessionState::Disconnected),
            execution: Mutex::new(ExecutionState::default()),
            seen_first_stop: AtomicBool::new(false),
            breakpoint_sync_deferred: AtomicBool::new(false),
            breakpoints: BreakpointManager::new(events.clone()),
            events,
            plugins: PluginManager::new(),
            write_cancel: cancel.child_token(),
            io_cancel: cancel.child_token(),
            cancel,
            io_handle: Mutex::new(None),
            shutdown: OnceCell::new(),
        }
    }

    fn session_state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "session state");
            *state = next;
        }
    }

    fn execution(&self) -> MutexGuard<'_, ExecutionState> {
        lock(&self.execution)
    }

    fn require_version(&self) -> Result<ProtocolVersion, ClientError> {
        self.version
            .get()
            .copied()
            .ok_or(ClientError::HandshakeIncomplete)
    }

    /// Thread index to send for a request that needs the program stopped.
    fn stopped_thread(&self, thread_index: i32) -> Result<u32, ClientError> {
        if !self.execution().is_stopped {
            return Err(ClientError::NotStopped);
        }
        u32::try_from(thread_index).map_err(|_| ClientError::InvalidThreadIndex(thread_index))
    }

    async fn write(&self, message: Outgoing) -> Result<(), ClientError> {
        let mut writer = tokio::select! {
            writer = self.writer.lock() => writer,
            _ = self.write_cancel.cancelled() => return Err(ClientError::ShuttingDown),
        };
        let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;
        tokio::select! {
            sent = writer.send(message) => sent?,
            _ = self.write_cancel.cancelled() => return Err(ClientError::ShuttingDown),
        }
        Ok(())
    }

    /// Next request id, never one of the ids reserved for the handshake and
    /// for updates.
    fn next_request_id(&self) -> u32 {
        loop {
            let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            if request_id != UPDATE_REQUEST_ID && request_id != HANDSHAKE_REQUEST_ID {
                return request_id;
            }
        }
    }

    fn resolve_response(&self, response: Response) {
        let request_id = response.request_id;
        self.pending.resolve(request_id, Reply::Response(response));
    }

    /// The control socket closed or failed.
    fn connection_lost(self: &Arc<Self>) {
        self.pending.fail_all();
        let session = self.clone();
        // not awaited: a shutdown already in progress may be waiting on this task
        tokio::spawn(async move {
            session.shutdown(ShutdownReason::AppExit, true).await;
        });
    }

    async fn handshake(&self) -> Result<ProtocolVersion, ClientError> {
        if let Some(version) = self.version.get() {
            return Ok(*version);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(HANDSHAKE_REQUEST_ID, None, tx);
        tracing::debug!("sending handshake");
        if let Err(e) = self.write(Outgoing::Handshake(HandshakeRequest::new())).await {
            self.pending.remove(HANDSHAKE_REQUEST_ID);
            return Err(e);
        }

        let reply = tokio::select! {
            biased;
            reply = rx => reply,
            _ = self.cancel.cancelled() => {
                self.pending.remove(HANDSHAKE_REQUEST_ID);
                return Err(ClientError::ConnectionClosed);
            }
        };
        match reply {
            Ok(Ok(Reply::Handshake(handshake))) => {
                if handshake.magic != DEBUGGER_MAGIC {
                    return Err(ClientError::HandshakeMismatch {
                        expected: DEBUGGER_MAGIC.to_string(),
                        actual: handshake.magic,
                    });
                }
                let version = handshake.protocol_version;
                if version.support() == VersionSupport::Unsupported {
                    return Err(ClientError::UnsupportedVersion(version));
                }
                Ok(version)
            }
            Ok(Ok(Reply::Response(_))) => Err(ClientError::HandshakeIncomplete),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    async fn handle_handshake(&self, handshake: HandshakeResponse) {
        let verified = handshake.magic == DEBUGGER_MAGIC;
        self.events.emit(ClientEvent::HandshakeVerified(verified));
        if !verified {
            tracing::error!(magic = %handshake.magic, "handshake magic mismatch");
            self.pending
                .resolve(HANDSHAKE_REQUEST_ID, Reply::Handshake(handshake));
            self.shutdown(ShutdownReason::HandshakeMismatch, true).await;
            return;
        }

        let version = handshake.protocol_version;
        if self.version.set(version).is_err() {
            tracing::warn!(%version, "ignoring repeated handshake");
            return;
        }
        self.set_state(SessionState::Ready);
        let support = version.support();
        tracing::info!(%version, ?support, timestamp = ?handshake.revision_timestamp, "handshake verified");
        self.events.emit(ClientEvent::ProtocolVersion {
            version,
            support,
            message: support_message(version, support),
        });
        self.pending
            .resolve(HANDSHAKE_REQUEST_ID, Reply::Handshake(handshake));

        if support == VersionSupport::Unsupported {
            self.shutdown(ShutdownReason::UnsupportedVersion, true).await;
        }
    }

    async fn handle_update(&self, update: Update) {
        tracing::debug!(update_type = ?update.update_type(), "handling update");
        self.plugins
            .dispatch(HookPoint::OnUpdate, |p| p.on_update(&update));

        match update.body {
            UpdateBody::AllThreadsStopped(stopped) => {
                self.handle_stop(
                    stopped.primary_thread_index,
                    stopped.stop_reason,
                    stopped.stop_reason_detail,
                    true,
                )
                .await
            }
            UpdateBody::ThreadAttached(attached) => {
                self.handle_stop(
                    attached.thread_index,
                    attached.stop_reason,
                    attached.stop_reason_detail,
                    false,
                )
                .await
            }
            UpdateBody::IoPortOpened(io) => self.open_io_port(io.port),
            UpdateBody::BreakpointVerified(verified) => {
                if let Err(e) = self
                    .breakpoints
                    .handle_verified(self, &verified.breakpoint_ids)
                    .await
                {
                    tracing::warn!(error = %e, "failed to handle breakpoint verification");
                }
            }
            UpdateBody::CompileError(error) => self.events.emit(ClientEvent::CompileError(error)),
            UpdateBody::BreakpointError(error) => {
                self.events.emit(ClientEvent::BreakpointError(error))
            }
        }
    }

    async fn handle_stop(
        &self,
        thread_index: i32,
        stop_reason: StopReason,
        detail: String,
        all_threads: bool,
    ) {
        if !stop_reason.suspends() {
            tracing::debug!(?stop_reason, thread_index, "ignoring non-suspending stop");
            return;
        }
        self.execution().stop(thread_index, all_threads);

        let first_stop = !self.seen_first_stop.swap(true, Ordering::SeqCst);
        if first_stop && !self.config.stop_on_entry {
            tracing::info!(thread_index, "continuing past entry stop");
            if let Err(e) = self.continue_().await {
                tracing::warn!(error = %e, "failed to continue past entry stop");
            }
            return;
        }

        if self.breakpoint_sync_deferred.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.sync_breakpoints().await {
                tracing::warn!(error = %e, "deferred breakpoint sync failed");
            }
        }

        if stop_reason == StopReason::RuntimeError {
            self.events.emit(ClientEvent::RuntimeError {
                thread_index,
                detail,
            });
        } else {
            self.events.emit(ClientEvent::Suspend {
                thread_index,
                stop_reason,
                detail,
            });
        }
    }

    fn open_io_port(&self, port: u32) {
        if !self.config.io_output {
            tracing::debug!(port, "IO output disabled, not connecting");
            return;
        }
        let Ok(port) = u16::try_from(port) else {
            tracing::warn!(port, "invalid IO port");
            return;
        };
        let handle = io_port::spawn(
            self.config.host.clone(),
            port,
            self.events.clone(),
            self.io_cancel.clone(),
        );
        if let Some(previous) = lock(&self.io_handle).replace(handle) {
            previous.abort();
        }
    }

    #[tracing::instrument(skip(self, body), fields(command = ?body.command()))]
    async fn send_request(&self, body: RequestBody) -> Result<Response, ClientError> {
        self.require_version()?;
        if self.session_state().is_terminal() && body.command() != Command::ExitChannel {
            return Err(ClientError::ShuttingDown);
        }

        let request_id = self.next_request_id();
        let mut request = Request::new(request_id, body);
        self.plugins.dispatch(HookPoint::BeforeSendRequest, |p| {
            p.before_send_request(&mut request)
        });
        let command = request.command();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, Some(command), tx);
        tracing::debug!(request_id, ?command, "sending request");
        if let Err(e) = self.write(Outgoing::Request(request.clone())).await {
            self.pending.remove(request_id);
            return Err(e);
        }
        self.plugins
            .dispatch(HookPoint::AfterSendRequest, |p| p.after_send_request(&request));

        let reply = tokio::select! {
            biased;
            reply = rx => reply,
            _ = self.cancel.cancelled() => {
                self.pending.remove(request_id);
                return Err(ClientError::ConnectionClosed);
            }
        };
        let response = match reply {
            Ok(Ok(Reply::Response(response))) => response,
            Ok(Ok(Reply::Handshake(_))) => return Err(ClientError::UnexpectedResponse(command)),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ClientError::ConnectionClosed),
        };
        tracing::debug!(request_id, error_code = %response.error_code, "received response");
        self.plugins
            .dispatch(HookPoint::OnResponse, |p| p.on_response(&response));
        Ok(response)
    }

    async fn continue_(&self) -> Result<Response, ClientError> {
        {
            let mut execution = self.execution();
            if !execution.is_stopped {
                return Err(ClientError::NotStopped);
            }
            execution.is_stopped = false;
        }
        let response = self.send_request(RequestBody::Continue).await?;
        if response.error_code.is_ok() {
            self.events.emit(ClientEvent::Continue);
        }
        Ok(response)
    }

    async fn pause(&self, force: bool) -> Result<Response, ClientError> {
        if self.execution().is_stopped && !force {
            return Err(ClientError::AlreadyStopped);
        }
        self.send_request(RequestBody::Stop).await
    }

    async fn step(&self, step_type: StepType) -> Result<Response, ClientError> {
        let thread_index = {
            let mut execution = self.execution();
            if !execution.is_stopped {
                return Err(ClientError::NotStopped);
            }
            let thread = execution.primary_thread_index;
            let thread_index =
                u32::try_from(thread).map_err(|_| ClientError::InvalidThreadIndex(thread))?;
            execution.is_stopped = false;
            thread_index
        };

        let response = self
            .send_request(RequestBody::Step(StepRequest {
                thread_index,
                step_type,
            }))
            .await?;

        if response.error_code.is_ok() {
            let thread_index = {
                let mut execution = self.execution();
                execution.is_stopped = true;
                execution.primary_thread_index
            };
            self.events.emit(ClientEvent::Suspend {
                thread_index,
                stop_reason: StopReason::Break,
                detail: String::new(),
            });
        } else {
            tracing::warn!(error_code = %response.error_code, ?step_type, "device refused to step");
            self.events.emit(ClientEvent::CannotContinue);
        }
        Ok(response)
    }

    async fn threads(&self) -> Result<Response, ClientError> {
        if !self.execution().is_stopped {
            return Err(ClientError::NotStopped);
        }
        let version = self.require_version()?;
        let mut response = self.send_request(RequestBody::Threads).await?;

        if let ResponseBody::Threads(body) = &mut response.body {
            let mut execution = self.execution();
            if version.has_reliable_primary_flag() {
                if let Some(index) = body.threads.iter().position(|t| t.is_primary) {
                    execution.primary_thread_index = index as i32;
                }
            } else {
                // older devices report the wrong primary thread after a step
                let primary = execution.primary_thread_index;
                for (index, thread) in body.threads.iter_mut().enumerate() {
                    thread.is_primary = index as i32 == primary;
                }
            }
        }
        Ok(response)
    }

    async fn stack_trace(&self, thread_index: i32) -> Result<Response, ClientError> {
        let thread_index = self.stopped_thread(thread_index)?;
        self.send_request(RequestBody::StackTrace(StackTraceRequest { thread_index }))
            .await
    }

    async fn variables<S: AsRef<str> + Sync>(
        &self,
        thread_index: i32,
        stack_frame_index: u32,
        path: &[S],
        get_child_keys: bool,
    ) -> Result<Response, ClientError> {
        let thread = self.stopped_thread(thread_index)?;
        let response = self
            .lookup(thread, stack_frame_index, path, get_child_keys)
            .await?;
        if response.error_code.is_ok() {
            return Ok(response);
        }

        let names: Vec<String> = path
            .iter()
            .map(|s| protocol::parse_path_segment(s.as_ref()).0)
            .collect();
        let synthesis = match variables::synthesize(&names, response.error_data.as_ref())? {
            None => return Ok(response),
            Some(Synthesis::NeedsParentType { index }) => {
                let parent_type = self
                    .variable_type(thread, stack_frame_index, &path[..index])
                    .await;
                variables::with_parent_type(&names, index, parent_type)
            }
            Some(synthesis) => synthesis,
        };

        match synthesis {
            Synthesis::Variable(variable) => {
                tracing::debug!(path = ?names, variable_type = ?variable.variable_type, "synthesized variable");
                Ok(Response::ok(
                    response.request_id,
                    ResponseBody::Variables(VariablesResponse {
                        variables: vec![variable],
                    }),
                ))
            }
            Synthesis::Failed(message) => Err(ClientError::VariableLookup(message)),
            Synthesis::NeedsParentType { .. } => Ok(response),
        }
    }

    async fn lookup<S: AsRef<str> + Sync>(
        &self,
        thread_index: u32,
        stack_frame_index: u32,
        path: &[S],
        get_child_keys: bool,
    ) -> Result<Response, ClientError> {
        let version = self.require_version()?;
        let mut request =
            VariablesRequest::from_user_path(path, version.supports_case_sensitivity_options());
        request.thread_index = thread_index;
        request.stack_frame_index = stack_frame_index;
        request.get_child_keys = get_child_keys;
        self.send_request(RequestBody::Variables(request)).await
    }

    /// Type of the variable at `path`, if the device can resolve it.
    async fn variable_type<S: AsRef<str> + Sync>(
        &self,
        thread_index: u32,
        stack_frame_index: u32,
        path: &[S],
    ) -> Option<VariableType> {
        let response = self
            .lookup(thread_index, stack_frame_index, path, false)
            .await
            .ok()?;
        match response.body {
            ResponseBody::Variables(body) if response.error_code.is_ok() => {
                body.variables.first().map(|v| v.variable_type)
            }
            _ => None,
        }
    }

    async fn execute(
        &self,
        thread_index: i32,
        stack_frame_index: u32,
        source_code: &str,
    ) -> Result<Response, ClientError> {
        let thread_index = self.stopped_thread(thread_index)?;
        self.send_request(RequestBody::Execute(ExecuteRequest {
            thread_index,
            stack_frame_index,
            source_code: source_code.to_string(),
        }))
        .await
    }

    async fn add_breakpoints(&self, breakpoints: Vec<BreakpointTarget>) -> Result<Response, ClientError> {
        if breakpoints.is_empty() {
            return Ok(Response::ok(
                0,
                ResponseBody::Breakpoints(Default::default()),
            ));
        }
        let version = self.require_version()?;
        let use_conditional = version.supports_conditional_breakpoints()
            && breakpoints
                .iter()
                .any(|bp| bp.condition.as_deref().is_some_and(|c| !c.trim().is_empty()));
        let file_path = |bp: &BreakpointTarget| -> String {
            match (&bp.component_library, bp.file_path.strip_prefix("pkg:/")) {
                (Some(library), Some(rest)) if version.supports_component_library_breakpoints() => {
                    format!("lib:/{library}/{rest}")
                }
                _ => bp.file_path.clone(),
            }
        };

        let body = if use_conditional {
            RequestBody::AddConditionalBreakpoints(AddConditionalBreakpointsRequest {
                flags: 0,
                breakpoints: breakpoints
                    .iter()
                    .map(|bp| ConditionalBreakpointLocation {
                        file_path: file_path(bp),
                        line_number: bp.line,
                        ignore_count: bp.ignore_count,
                        condition_expression: bp.condition.clone().unwrap_or_default(),
                    })
                    .collect(),
            })
        } else {
            RequestBody::AddBreakpoints(AddBreakpointsRequest {
                breakpoints: breakpoints
                    .iter()
                    .map(|bp| BreakpointLocation {
                        file_path: file_path(bp),
                        line_number: bp.line,
                        ignore_count: bp.ignore_count,
                    })
                    .collect(),
            })
        };
        self.send_request(body).await
    }

    async fn remove_breakpoints(&self, breakpoint_ids: Vec<u32>) -> Result<Response, ClientError> {
        if breakpoint_ids.is_empty() {
            return Ok(Response::ok(
                0,
                ResponseBody::Breakpoints(Default::default()),
            ));
        }
        self.send_request(RequestBody::RemoveBreakpoints(RemoveBreakpointsRequest {
            breakpoint_ids,
        }))
        .await
    }

    async fn sync_breakpoints(&self) -> Result<SyncReport, ClientError> {
        let version = self.require_version()?;
        if !version.supports_breakpoint_registration_while_running()
            && !self.execution().is_stopped
        {
            tracing::debug!(%version, "deferring breakpoint sync until the program stops");
            self.breakpoint_sync_deferred.store(true, Ordering::SeqCst);
            return Ok(SyncReport::default());
        }
        self.breakpoints.sync(self).await
    }

    /// Tear the session down once. Concurrent and later calls wait for the
    /// first and return its reason.
    async fn shutdown(&self, reason: ShutdownReason, immediate: bool) -> ShutdownReason {
        *self
            .shutdown
            .get_or_init(|| self.run_shutdown(reason, immediate))
            .await
    }

    async fn run_shutdown(&self, reason: ShutdownReason, immediate: bool) -> ShutdownReason {
        tracing::info!(%reason, immediate, "shutting down");
        self.plugins
            .dispatch(HookPoint::BeforeShutdown, |p| p.before_shutdown(reason));
        self.set_state(SessionState::ShuttingDown);

        if immediate {
            self.write_cancel.cancel();
            if self.writer.lock().await.take().is_some() {
                tracing::debug!("dropped control socket writer");
            }
        } else {
            if self.version.get().is_some() {
                let exit = self.send_request(RequestBody::ExitChannel);
                match tokio::time::timeout(self.config.exit_channel_timeout(), exit).await {
                    Ok(Ok(response)) => {
                        tracing::debug!(error_code = %response.error_code, "exit channel acknowledged")
                    }
                    Ok(Err(e)) => tracing::debug!(error = %e, "exit channel failed"),
                    Err(_) => tracing::warn!("timed out waiting for exit channel"),
                }
            }

            let close_timeout = self.config.socket_close_timeout();
            let close_control = async {
                if let Some(mut writer) = self.writer.lock().await.take() {
                    if let Err(e) = writer.shutdown().await {
                        tracing::debug!(error = %e, "error closing control socket");
                    }
                }
            };
            if tokio::time::timeout(close_timeout, close_control).await.is_err() {
                tracing::warn!("timed out closing control socket");
            }

            self.io_cancel.cancel();
            let io_handle = lock(&self.io_handle).take();
            if let Some(handle) = io_handle {
                if tokio::time::timeout(close_timeout, handle).await.is_err() {
                    tracing::warn!("timed out closing IO socket");
                }
            }
        }

        self.io_cancel.cancel();
        self.cancel.cancel();
        self.pending.fail_all();
        self.set_state(SessionState::Closed);
        self.events.emit(ClientEvent::Close(reason));
        reason
    }
}

impl BreakpointRequests for Session {
    fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.version.get().copied()
    }

    fn add_breakpoints(
        &self,
        breakpoints: Vec<BreakpointTarget>,
    ) -> impl Future<Output = Result<Response, ClientError>> + Send {
        Session::add_breakpoints(self, breakpoints)
    }

    fn remove_breakpoints(
        &self,
        breakpoint_ids: Vec<u32>,
    ) -> impl Future<Output = Result<Response, ClientError>> + Send {
        Session::remove_breakpoints(self, breakpoint_ids)
    }
}

/// Advice shown when the device speaks a version outside the tested range.
fn support_message(version: ProtocolVersion, support: VersionSupport) -> Option<String> {
    let tracker = option_env!("CARGO_PKG_REPOSITORY")
        .filter(|url| !url.is_empty())
        .unwrap_or("the project's issue tracker");
    match support {
        VersionSupport::Supported => None,
        VersionSupport::Untested => Some(format!(
            "protocol version {version} is newer than the latest tested version \
             {SUPPORTED_MAX}; debugging may not work as expected. Please report problems at {tracker}"
        )),
        VersionSupport::Unsupported => Some(format!(
            "protocol version {version} is not supported (supported versions are \
             {SUPPORTED_MIN} to {SUPPORTED_MAX}). Please report this at {tracker}"
        )),
    }
}
