use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use clap::Parser;
use client::{ClientConfig, ClientEvent, DebugProtocolClient, EventReceiver, SourceBreakpoint};
use color_eyre::eyre::{self, Context};
use protocol::{Response, ResponseBody};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::filter::EnvFilter;

/// A breakpoint given as `file:line`.
#[derive(Debug, Clone)]
struct BreakpointArg {
    file: String,
    line: u32,
}

impl FromStr for BreakpointArg {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (file, line) = s
            .rsplit_once(':')
            .ok_or_else(|| eyre::eyre!("expected file:line, got '{s}'"))?;
        let line = line
            .parse()
            .with_context(|| format!("invalid line number in '{s}'"))?;
        Ok(Self {
            file: file.to_string(),
            line,
        })
    }
}

struct App {
    client: DebugProtocolClient,
    events: EventReceiver,
    breakpoints: BTreeMap<String, Vec<SourceBreakpoint>>,
}

impl App {
    fn new(client: DebugProtocolClient, events: EventReceiver) -> Self {
        Self {
            client,
            events,
            breakpoints: BTreeMap::new(),
        }
    }

    fn add_breakpoint(&mut self, breakpoint: BreakpointArg) {
        tracing::debug!(?breakpoint, "adding breakpoint");
        let lines = self.breakpoints.entry(breakpoint.file.clone()).or_default();
        lines.push(SourceBreakpoint::at_line(breakpoint.line));
        self.client
            .breakpoints()
            .set_breakpoints(&breakpoint.file, lines.clone());
    }

    async fn run(&mut self) -> eyre::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush()?;

            let should_quit = tokio::select! {
                line = lines.next_line() => match line.context("reading from stdin")? {
                    Some(line) => self.handle_input(line.trim()).await.context("handling command")?,
                    None => ShouldQuit::True,
                },
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => ShouldQuit::True,
                },
            };
            if let ShouldQuit::True = should_quit {
                break;
            }
        }

        let reason = self.client.shutdown().await;
        tracing::debug!(%reason, "session closed");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn handle_event(&mut self, event: ClientEvent) -> ShouldQuit {
        match event {
            ClientEvent::Suspend {
                thread_index,
                stop_reason,
                detail,
            } => println!("thread {thread_index} stopped ({stop_reason:?}) {detail}"),
            ClientEvent::RuntimeError {
                thread_index,
                detail,
            } => println!("runtime error on thread {thread_index}: {detail}"),
            ClientEvent::Continue => println!("program running"),
            ClientEvent::CannotContinue => println!("cannot continue"),
            ClientEvent::ProtocolVersion {
                version, message, ..
            } => {
                println!("device speaks protocol {version}");
                if let Some(message) = message {
                    println!("{message}");
                }
            }
            ClientEvent::BreakpointsVerified(breakpoints) => {
                for bp in breakpoints {
                    println!("breakpoint {} verified at {}:{}", bp.id, bp.src_path, bp.line);
                }
            }
            ClientEvent::BreakpointsResurrected(breakpoints) => {
                for bp in breakpoints {
                    println!("breakpoint {} could not be removed", bp.id);
                }
            }
            ClientEvent::BreakpointError(error) => {
                for message in error
                    .compile_errors
                    .iter()
                    .chain(&error.runtime_errors)
                    .chain(&error.other_errors)
                {
                    println!("breakpoint {}: {message}", error.breakpoint_id);
                }
            }
            ClientEvent::CompileError(error) => println!(
                "compile error in {}:{}: {}",
                error.file_path, error.line_number, error.error_message
            ),
            ClientEvent::IoOutput(line) => println!("{line}"),
            ClientEvent::Close(reason) => {
                println!("session closed ({reason})");
                return ShouldQuit::True;
            }
            ClientEvent::Connected | ClientEvent::HandshakeVerified(_) => {}
        }
        ShouldQuit::False
    }

    async fn handle_input(&mut self, input: &str) -> eyre::Result<ShouldQuit> {
        let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
        let rest = rest.trim();
        let thread = self.client.execution_state().primary_thread_index;

        let response = match command {
            "q" | "quit" => return Ok(ShouldQuit::True),
            "" => return Ok(ShouldQuit::False),
            "c" => self.client.continue_().await,
            "p" => self.client.pause(false).await,
            "s" => self.client.step_in().await,
            "n" => self.client.step_over().await,
            "o" => self.client.step_out().await,
            "t" => self.client.threads().await,
            "bt" => self.client.stack_trace(thread).await,
            "v" => {
                let path: Vec<&str> = rest.split('.').filter(|s| !s.is_empty()).collect();
                let frame = self.client.execution_state().stack_frame_index;
                self.client.variables(thread, frame, &path, true).await
            }
            "e" => {
                let frame = self.client.execution_state().stack_frame_index;
                self.client.execute(thread, frame, rest).await
            }
            "b" => {
                let breakpoint: BreakpointArg = rest.parse()?;
                self.add_breakpoint(breakpoint);
                let report = self
                    .client
                    .sync_breakpoints()
                    .await
                    .context("syncing breakpoints")?;
                println!(
                    "{} added, {} rejected",
                    report.added.len(),
                    report.rejected.len()
                );
                return Ok(ShouldQuit::False);
            }
            "bl" => {
                for bp in self.client.breakpoints().breakpoints() {
                    let state = self.client.breakpoints().device_state(bp.id);
                    println!(
                        "{} {}:{} {:?}",
                        bp.id,
                        bp.src_path,
                        bp.line,
                        state.map(|s| s.status)
                    );
                }
                return Ok(ShouldQuit::False);
            }
            other => {
                println!("Unhandled command: '{other}'");
                return Ok(ShouldQuit::False);
            }
        };

        match response {
            Ok(response) => print_response(&response),
            Err(e) => println!("{e}"),
        }
        Ok(ShouldQuit::False)
    }
}

fn print_response(response: &Response) {
    if !response.error_code.is_ok() {
        println!("device error: {}", response.error_code);
        return;
    }
    match &response.body {
        ResponseBody::Empty => {}
        ResponseBody::Threads(body) => {
            for (index, thread) in body.threads.iter().enumerate() {
                let marker = if thread.is_primary { "*" } else { " " };
                println!(
                    "{marker}{index} {} at {}:{}",
                    thread.function_name, thread.file_path, thread.line_number
                );
            }
        }
        ResponseBody::StackTrace(body) => {
            for (index, frame) in body.entries.iter().enumerate() {
                println!(
                    "#{index} {} at {}:{}",
                    frame.function_name, frame.file_path, frame.line_number
                );
            }
        }
        ResponseBody::Variables(body) => {
            for variable in &body.variables {
                let value = variable
                    .value
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                println!(
                    "{} ({}) {value}",
                    variable.name.as_deref().unwrap_or("?"),
                    variable.variable_type.as_str()
                );
            }
        }
        ResponseBody::Execute(body) => {
            if !body.execute_success {
                for message in body
                    .compile_errors
                    .iter()
                    .chain(&body.runtime_errors)
                    .chain(&body.other_errors)
                {
                    println!("{message}");
                }
            }
        }
        ResponseBody::Breakpoints(body) => {
            for bp in &body.breakpoints {
                println!("{} {}", bp.breakpoint_id, bp.error_code);
            }
        }
    }
}

#[derive(Debug, Parser)]
struct Args {
    /// Address of the device; overrides the configuration file.
    host: Option<String>,

    #[clap(short, long)]
    port: Option<u16>,

    /// Configuration file to use instead of the default one.
    #[clap(short, long)]
    config: Option<PathBuf>,

    #[clap(short, long)]
    breakpoints: Vec<BreakpointArg>,

    /// Continue past the first stop instead of reporting it.
    #[clap(long)]
    no_stop_on_entry: bool,

    #[clap(long, default_value = "devdbg.log")]
    log_file: PathBuf,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install().context("installing color_eyre")?;
    let args = Args::parse();

    let log_file = std::fs::File::create(&args.log_file).context("creating log file")?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(Mutex::new(log_file))
        .init();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::load_default()?,
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.control_port = port;
    }
    if args.no_stop_on_entry {
        config.stop_on_entry = false;
    }

    let mut client = DebugProtocolClient::new(config);
    let events = client.subscribe();
    client.connect().await.context("connecting to device")?;
    tracing::debug!("connected");

    let mut app = App::new(client, events);
    for breakpoint in args.breakpoints {
        app.add_breakpoint(breakpoint);
    }
    app.client
        .sync_breakpoints()
        .await
        .context("adding breakpoints")?;
    tracing::debug!("breakpoints added");

    app.run().await
}

enum ShouldQuit {
    True,
    False,
}
