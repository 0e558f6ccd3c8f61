//! Shared harness: a client connected to a scripted device over memory.
#![allow(dead_code)]

use std::io::IsTerminal;
use std::time::Duration;

use client::{ClientConfig, ClientEvent, DebugProtocolClient, EventReceiver};
use eyre::{Result, eyre};
use protocol::{
    AllThreadsStopped, Command, Request, Response, ResponseBody, StopReason, Update, UpdateBody,
};
use server::{DeviceServer, ServerConfig, ServerError};
use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub client: DebugProtocolClient,
    pub device: DeviceServer,
    pub events: EventReceiver,
}

/// Connect a client to a fresh in-memory device and complete the handshake.
pub async fn connect(server_config: ServerConfig, client_config: ClientConfig) -> Result<Harness> {
    let (mut device, transport) = DeviceServer::memory(server_config);
    let mut client = DebugProtocolClient::new(client_config);
    let events = client.subscribe();
    let (connected, accepted) = tokio::join!(
        client.connect_transport(transport),
        device.accept_handshake()
    );
    accepted?;
    connected?;
    Ok(Harness {
        client,
        device,
        events,
    })
}

pub async fn connect_default() -> Result<Harness> {
    connect(ServerConfig::default(), ClientConfig::default()).await
}

impl Harness {
    /// Report all threads stopped at `thread_index` and wait for the client
    /// to announce the suspend.
    pub async fn stop(&mut self, thread_index: i32) -> Result<()> {
        self.device.send_update(stopped(thread_index)).await?;
        self.wait_for(|e| matches!(e, ClientEvent::Suspend { .. }))
            .await?;
        Ok(())
    }

    pub async fn wait_for<F>(&mut self, pred: F) -> Result<ClientEvent>
    where
        F: Fn(&ClientEvent) -> bool,
    {
        wait_for(&mut self.events, pred).await
    }
}

pub async fn wait_for<F>(events: &mut EventReceiver, pred: F) -> Result<ClientEvent>
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, events.wait_for(pred))
        .await
        .map_err(|_| eyre!("timed out waiting for event"))?
        .ok_or_else(|| eyre!("event stream ended"))
}

pub fn stopped(thread_index: i32) -> Update {
    Update::new(UpdateBody::AllThreadsStopped(AllThreadsStopped {
        primary_thread_index: thread_index,
        stop_reason: StopReason::Break,
        stop_reason_detail: String::new(),
    }))
}

/// Expect a `command` request and answer it with an OK `body`.
pub async fn reply(
    device: &mut DeviceServer,
    command: Command,
    body: ResponseBody,
) -> Result<Request, ServerError> {
    let request = device.expect_command(command).await?;
    device
        .respond(Response::ok(request.request_id, body))
        .await?;
    Ok(request)
}

/// Expect a `command` request and answer it with whatever `respond` builds
/// from it.
pub async fn reply_with<F>(
    device: &mut DeviceServer,
    command: Command,
    respond: F,
) -> Result<Request, ServerError>
where
    F: FnOnce(&Request) -> Response,
{
    let request = device.expect_command(command).await?;
    device.respond(respond(&request)).await?;
    Ok(request)
}
