mod common;

use std::sync::{Arc, Mutex};

use client::{
    ClientConfig, ClientError, ClientEvent, ClientPlugin, DebugProtocolClient, NOT_DEFINED_VALUE,
    SessionState, ShutdownReason,
};
use common::{Harness, connect, connect_default, reply, reply_with, stopped, wait_for};
use eyre::Result;
use protocol::{
    Command, ErrorCode, ErrorData, ProtocolVersion, Request, RequestBody, Response, ResponseBody,
    StepRequest, StepType, StopReason, ThreadInfo, ThreadsResponse, Update, Variable,
    VariableType, VariableValue, VariablesResponse, VersionSupport,
};
use server::{DeviceServer, ServerConfig, ServerError};

fn thread(is_primary: bool, function_name: &str) -> ThreadInfo {
    ThreadInfo {
        is_primary,
        stop_reason: StopReason::Break,
        stop_reason_detail: String::new(),
        line_number: 1,
        function_name: function_name.into(),
        file_path: "pkg:/source/main.brs".into(),
        code_snippet: String::new(),
    }
}

#[tokio::test]
async fn handshake_reports_version() -> Result<()> {
    let mut h = connect_default().await?;

    assert_eq!(
        h.wait_for(|e| matches!(e, ClientEvent::Connected)).await?,
        ClientEvent::Connected
    );
    assert_eq!(
        h.wait_for(|e| matches!(e, ClientEvent::HandshakeVerified(_)))
            .await?,
        ClientEvent::HandshakeVerified(true)
    );
    assert_eq!(
        h.wait_for(|e| matches!(e, ClientEvent::ProtocolVersion { .. }))
            .await?,
        ClientEvent::ProtocolVersion {
            version: ProtocolVersion::V3_2_0,
            support: VersionSupport::Supported,
            message: None,
        }
    );
    assert_eq!(h.client.protocol_version(), Some(ProtocolVersion::V3_2_0));
    assert_eq!(h.client.session_state(), SessionState::Ready);
    Ok(())
}

#[tokio::test]
async fn newer_versions_are_untested() -> Result<()> {
    let version = ProtocolVersion::new(3, 3, 0);
    let mut h = connect(ServerConfig::with_version(version), ClientConfig::default()).await?;

    let ClientEvent::ProtocolVersion {
        support, message, ..
    } = h
        .wait_for(|e| matches!(e, ClientEvent::ProtocolVersion { .. }))
        .await?
    else {
        unreachable!()
    };
    assert_eq!(support, VersionSupport::Untested);
    assert!(message.is_some_and(|m| m.contains("3.3.0")));
    assert_eq!(h.client.session_state(), SessionState::Ready);
    Ok(())
}

#[tokio::test]
async fn handshake_mismatch_closes_the_session() -> Result<()> {
    let config = ServerConfig {
        magic: "notbsdebug".into(),
        ..ServerConfig::default()
    };
    let (mut device, transport) = DeviceServer::memory(config);
    let mut client = DebugProtocolClient::new(ClientConfig::default());
    let mut events = client.subscribe();

    let (connected, accepted) = tokio::join!(
        client.connect_transport(transport),
        device.accept_handshake()
    );
    accepted?;
    assert!(matches!(
        connected,
        Err(ClientError::HandshakeMismatch { ref actual, .. }) if actual == "notbsdebug"
    ));

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ClientEvent::HandshakeVerified(_))).await?,
        ClientEvent::HandshakeVerified(false)
    );
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ClientEvent::Close(_))).await?,
        ClientEvent::Close(ShutdownReason::HandshakeMismatch)
    );
    assert_eq!(client.session_state(), SessionState::Closed);
    assert_eq!(client.protocol_version(), None);

    // nothing else reaches the device
    assert!(matches!(
        client.send_request(RequestBody::Threads).await,
        Err(ClientError::HandshakeIncomplete)
    ));
    assert!(matches!(
        device.expect_request().await,
        Err(ServerError::Disconnected)
    ));
    Ok(())
}

#[tokio::test]
async fn unsupported_version_closes_the_session() -> Result<()> {
    let (mut device, transport) =
        DeviceServer::memory(ServerConfig::with_version(ProtocolVersion::new(0, 9, 0)));
    let mut client = DebugProtocolClient::new(ClientConfig::default());
    let mut events = client.subscribe();

    let (connected, accepted) = tokio::join!(
        client.connect_transport(transport),
        device.accept_handshake()
    );
    accepted?;
    assert!(matches!(connected, Err(ClientError::UnsupportedVersion(_))));
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ClientEvent::Close(_))).await?,
        ClientEvent::Close(ShutdownReason::UnsupportedVersion)
    );
    Ok(())
}

#[tokio::test]
async fn stop_and_continue() -> Result<()> {
    let mut h = connect_default().await?;
    assert!(matches!(
        h.client.continue_().await,
        Err(ClientError::NotStopped)
    ));
    assert!(matches!(
        h.client.stack_trace(0).await,
        Err(ClientError::NotStopped)
    ));

    h.stop(1).await?;
    assert!(h.client.is_stopped());
    assert_eq!(h.client.execution_state().primary_thread_index, 1);
    assert!(matches!(
        h.client.pause(false).await,
        Err(ClientError::AlreadyStopped)
    ));
    assert!(matches!(
        h.client.stack_trace(-1).await,
        Err(ClientError::InvalidThreadIndex(-1))
    ));

    let client = &h.client;
    let device = &mut h.device;
    let (response, request) = tokio::join!(
        client.continue_(),
        reply(device, Command::Continue, ResponseBody::Empty)
    );
    assert!(response?.error_code.is_ok());
    assert_eq!(request?.body, RequestBody::Continue);
    h.wait_for(|e| matches!(e, ClientEvent::Continue)).await?;
    assert!(!h.client.is_stopped());

    let client = &h.client;
    let device = &mut h.device;
    let (response, request) = tokio::join!(
        client.pause(false),
        reply(device, Command::Stop, ResponseBody::Empty)
    );
    assert!(response?.error_code.is_ok());
    assert_eq!(request?.body, RequestBody::Stop);
    Ok(())
}

#[tokio::test]
async fn runtime_errors_are_reported() -> Result<()> {
    let mut h = connect_default().await?;
    let mut update = stopped(0);
    if let protocol::UpdateBody::AllThreadsStopped(s) = &mut update.body {
        s.stop_reason = StopReason::RuntimeError;
        s.stop_reason_detail = "Divide by zero".into();
    }
    h.device.send_update(update).await?;

    assert_eq!(
        h.wait_for(|e| matches!(e, ClientEvent::RuntimeError { .. }))
            .await?,
        ClientEvent::RuntimeError {
            thread_index: 0,
            detail: "Divide by zero".into(),
        }
    );
    assert!(h.client.is_stopped());
    Ok(())
}

#[tokio::test]
async fn step_uses_the_primary_thread() -> Result<()> {
    let mut h = connect_default().await?;
    assert!(matches!(
        h.client.step_over().await,
        Err(ClientError::NotStopped)
    ));
    h.stop(2).await?;

    let client = &h.client;
    let device = &mut h.device;
    let (response, request) = tokio::join!(
        client.step_over(),
        reply(device, Command::Step, ResponseBody::Empty)
    );
    assert!(response?.error_code.is_ok());
    assert_eq!(
        request?.body,
        RequestBody::Step(StepRequest {
            thread_index: 2,
            step_type: StepType::Over,
        })
    );
    let event = h
        .wait_for(|e| matches!(e, ClientEvent::Suspend { .. }))
        .await?;
    assert!(matches!(event, ClientEvent::Suspend { thread_index: 2, .. }));
    assert!(h.client.is_stopped());

    // a refused step leaves the program running
    let client = &h.client;
    let device = &mut h.device;
    let (response, _) = tokio::join!(
        client.step_in(),
        reply_with(device, Command::Step, |r| Response::error(
            r.request_id,
            ErrorCode::CantContinue
        ))
    );
    assert_eq!(response?.error_code, ErrorCode::CantContinue);
    h.wait_for(|e| matches!(e, ClientEvent::CannotContinue))
        .await?;
    assert!(!h.client.is_stopped());
    Ok(())
}

#[tokio::test]
async fn old_devices_report_the_stopping_thread_as_primary() -> Result<()> {
    let mut h = connect(
        ServerConfig::with_version(ProtocolVersion::V3_0_0),
        ClientConfig::default(),
    )
    .await?;
    h.stop(1).await?;

    let client = &h.client;
    let device = &mut h.device;
    let (response, _) = tokio::join!(
        client.threads(),
        reply(
            device,
            Command::Threads,
            ResponseBody::Threads(ThreadsResponse {
                threads: vec![thread(true, "main"), thread(false, "worker")],
            })
        )
    );
    let ResponseBody::Threads(threads) = response?.body else {
        panic!("expected threads");
    };
    assert!(!threads.threads[0].is_primary);
    assert!(threads.threads[1].is_primary);
    assert_eq!(h.client.execution_state().primary_thread_index, 1);
    Ok(())
}

#[tokio::test]
async fn newer_devices_choose_the_primary_thread() -> Result<()> {
    let mut h = connect(
        ServerConfig::with_version(ProtocolVersion::V3_1_0),
        ClientConfig::default(),
    )
    .await?;
    h.stop(1).await?;

    let client = &h.client;
    let device = &mut h.device;
    let (response, _) = tokio::join!(
        client.threads(),
        reply(
            device,
            Command::Threads,
            ResponseBody::Threads(ThreadsResponse {
                threads: vec![thread(true, "main"), thread(false, "worker")],
            })
        )
    );
    let ResponseBody::Threads(threads) = response?.body else {
        panic!("expected threads");
    };
    assert!(threads.threads[0].is_primary);
    assert_eq!(h.client.execution_state().primary_thread_index, 0);
    Ok(())
}

#[tokio::test]
async fn missing_key_on_associative_array_is_not_defined() -> Result<()> {
    let mut h = connect_default().await?;
    h.stop(0).await?;

    let client = &h.client;
    let device = &mut h.device;
    let script = async {
        let lookup = reply_with(device, Command::Variables, |r| {
            Response::error(r.request_id, ErrorCode::OtherErr).with_error_data(ErrorData {
                invalid_path_index: None,
                missing_key_index: Some(2),
            })
        })
        .await?;
        let parent = reply(
            device,
            Command::Variables,
            ResponseBody::Variables(VariablesResponse {
                variables: vec![Variable::new("top", VariableType::AssociativeArray)],
            }),
        )
        .await?;
        Ok::<_, ServerError>((lookup, parent))
    };
    let (response, requests) = tokio::join!(
        client.variables(0, 0, &["m", "top", "missingProp"], false),
        script
    );
    let (lookup, parent) = requests?;

    let RequestBody::Variables(lookup) = lookup.body else {
        panic!("expected a variables request");
    };
    assert_eq!(lookup.variable_path, ["m", "top", "missingProp"]);
    let RequestBody::Variables(parent) = parent.body else {
        panic!("expected a variables request");
    };
    assert_eq!(parent.variable_path, ["m", "top"]);

    let response = response?;
    assert!(response.error_code.is_ok());
    assert_eq!(
        response.body,
        ResponseBody::Variables(VariablesResponse {
            variables: vec![
                Variable::new("missingProp", VariableType::Invalid)
                    .with_value(VariableValue::String(NOT_DEFINED_VALUE.into()))
            ],
        })
    );
    Ok(())
}

fn variables_of_unknown_type() -> ResponseBody {
    ResponseBody::Variables(VariablesResponse {
        variables: vec![
            Variable::new("future", VariableType::from(42u8))
                .with_value(VariableValue::String("opaque".into())),
            Variable::new("after", VariableType::Integer).with_value(VariableValue::Integer(1)),
        ],
    })
}

#[tokio::test]
async fn unknown_variable_types_arrive_without_a_value() -> Result<()> {
    let mut h = connect_default().await?;
    h.stop(0).await?;

    let client = &h.client;
    let device = &mut h.device;
    let (response, request) = tokio::join!(
        client.variables(0, 0, &["future"], false),
        reply(device, Command::Variables, variables_of_unknown_type())
    );
    request?;

    let ResponseBody::Variables(body) = response?.body else {
        panic!("expected variables");
    };
    assert_eq!(body.variables.len(), 1);
    assert_eq!(body.variables[0].name.as_deref(), Some("future"));
    assert_eq!(body.variables[0].value, None);
    Ok(())
}

#[tokio::test]
async fn undecodable_response_fails_the_request() -> Result<()> {
    let mut h = connect(
        ServerConfig::with_version(ProtocolVersion::new(2, 0, 0)),
        ClientConfig::default(),
    )
    .await?;
    h.stop(0).await?;

    let client = &h.client;
    let device = &mut h.device;
    let (response, request) = tokio::join!(
        client.variables(0, 0, &["future"], false),
        reply(device, Command::Variables, variables_of_unknown_type())
    );
    request?;
    assert!(matches!(
        response,
        Err(ClientError::UndecodableResponse { .. })
    ));
    assert_eq!(h.client.pending_requests(), 0);

    // the session is still usable
    let client = &h.client;
    let device = &mut h.device;
    let (response, request) = tokio::join!(
        client.threads(),
        reply(
            device,
            Command::Threads,
            ResponseBody::Threads(ThreadsResponse {
                threads: vec![thread(true, "main")],
            })
        )
    );
    request?;
    assert!(response?.error_code.is_ok());
    Ok(())
}

#[tokio::test]
async fn lookup_through_uninitialized_variable_fails() -> Result<()> {
    let mut h = connect_default().await?;
    h.stop(0).await?;

    let client = &h.client;
    let device = &mut h.device;
    let (response, request) = tokio::join!(
        client.variables(0, 0, &["\"Name\"", "first"], true),
        reply_with(device, Command::Variables, |r| {
            Response::error(r.request_id, ErrorCode::OtherErr).with_error_data(ErrorData {
                invalid_path_index: None,
                missing_key_index: Some(0),
            })
        })
    );

    let RequestBody::Variables(request) = request?.body else {
        panic!("expected a variables request");
    };
    assert_eq!(request.variable_path, ["Name", "first"]);
    assert_eq!(request.force_case_insensitive, Some(vec![false, true]));
    assert!(request.get_child_keys);

    match response {
        Err(ClientError::VariableLookup(message)) => {
            assert_eq!(message, "cannot read 'first' on type 'Uninitialized'")
        }
        other => panic!("expected a lookup error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn first_stop_is_skipped_without_stop_on_entry() -> Result<()> {
    let config = ClientConfig {
        stop_on_entry: false,
        ..ClientConfig::default()
    };
    let mut h = connect(ServerConfig::default(), config).await?;

    h.device.send_update(stopped(0)).await?;
    reply(&mut h.device, Command::Continue, ResponseBody::Empty).await?;
    h.wait_for(|e| matches!(e, ClientEvent::Continue)).await?;
    assert!(!h.client.is_stopped());

    h.stop(0).await?;
    assert!(h.client.is_stopped());
    Ok(())
}

#[tokio::test]
async fn program_output_is_forwarded() -> Result<()> {
    let mut h = connect_default().await?;
    let io = h.device.open_io_port().await?;
    let mut channel = io.accept().await?;
    channel.write("first line\nsecond").await?;
    channel.write(" line\n").await?;

    assert_eq!(
        h.wait_for(|e| matches!(e, ClientEvent::IoOutput(_))).await?,
        ClientEvent::IoOutput("first line".into())
    );
    assert_eq!(
        h.wait_for(|e| matches!(e, ClientEvent::IoOutput(_))).await?,
        ClientEvent::IoOutput("second line".into())
    );
    Ok(())
}

#[tokio::test]
async fn shutdown_is_idempotent() -> Result<()> {
    let Harness {
        mut client,
        mut device,
        mut events,
    } = connect_default().await?;

    let (reason, exit) = tokio::join!(
        client.shutdown(),
        reply(&mut device, Command::ExitChannel, ResponseBody::Empty)
    );
    assert_eq!(reason, ShutdownReason::UserRequest);
    exit?;
    assert!(matches!(
        device.expect_request().await,
        Err(ServerError::Disconnected)
    ));

    assert_eq!(client.shutdown().await, ShutdownReason::UserRequest);
    assert_eq!(client.session_state(), SessionState::Closed);
    assert!(matches!(
        client.send_request(RequestBody::Threads).await,
        Err(ClientError::ShuttingDown)
    ));

    let mut closes = 0;
    while let Ok(Some(event)) =
        tokio::time::timeout(std::time::Duration::from_millis(100), events.recv()).await
    {
        if matches!(event, ClientEvent::Close(_)) {
            closes += 1;
        }
    }
    assert_eq!(closes, 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_gives_up_on_a_silent_device() -> Result<()> {
    let config = ClientConfig {
        exit_channel_timeout_ms: 50,
        ..ClientConfig::default()
    };
    let Harness {
        mut client,
        mut device,
        ..
    } = connect(ServerConfig::default(), config).await?;

    let (reason, request) = tokio::join!(
        client.shutdown(),
        device.expect_command(Command::ExitChannel)
    );
    request?;
    assert_eq!(reason, ShutdownReason::UserRequest);
    assert_eq!(client.session_state(), SessionState::Closed);
    assert_eq!(client.pending_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn device_disconnect_ends_the_session() -> Result<()> {
    let Harness {
        client,
        device,
        mut events,
    } = connect_default().await?;
    drop(device);

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ClientEvent::Close(_))).await?,
        ClientEvent::Close(ShutdownReason::AppExit)
    );
    assert_eq!(client.session_state(), SessionState::Closed);
    Ok(())
}

#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<String>>,
}

impl ClientPlugin for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn before_send_request(&self, request: &mut Request) {
        self.log
            .lock()
            .unwrap()
            .push(format!("send {}", request.command()));
    }

    fn on_response(&self, response: &Response) {
        self.log
            .lock()
            .unwrap()
            .push(format!("response {}", response.request_id));
    }

    fn on_update(&self, update: &Update) {
        self.log
            .lock()
            .unwrap()
            .push(format!("update {:?}", update.update_type()));
    }

    fn before_shutdown(&self, reason: ShutdownReason) {
        self.log.lock().unwrap().push(format!("shutdown {reason}"));
    }
}

#[tokio::test]
async fn plugins_see_the_session() -> Result<()> {
    let mut h = connect_default().await?;
    let recorder = Arc::new(Recorder::default());
    h.client.plugins().register(recorder.clone());

    h.stop(0).await?;
    let client = &h.client;
    let device = &mut h.device;
    let (response, _) = tokio::join!(
        client.continue_(),
        reply(device, Command::Continue, ResponseBody::Empty)
    );
    let request_id = response?.request_id;
    drop(h);

    let log = recorder.log.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![
            "update AllThreadsStopped".to_string(),
            "send Continue".to_string(),
            format!("response {request_id}"),
        ]
    );
    Ok(())
}
