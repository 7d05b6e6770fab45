//! ash-bridge - in-sandbox command/event bridge.
//!
//! Runs inside each sandbox, listens on a local stream socket, and drives
//! the upstream agent SDK. Commands arrive as newline-delimited JSON; for
//! each `query` the upstream SDK is run as a child process emitting
//! stream-json messages on stdout, each forwarded verbatim as a `message`
//! event. `interrupt` and `shutdown` act on the in-flight query; everything
//! else is processed one command at a time.
//!
//! Configuration comes from the environment (exported by the sandbox
//! manager): socket path, agent dir, workspace dir, SDK binary, and the
//! mock-SDK switch used by tests and local development.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::OwnedWriteHalf;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use ash_protocol::{BridgeCommand, BridgeEvent, LogLevel, codec};

#[derive(Parser, Debug, Clone)]
#[command(name = "ash-bridge", about = "In-sandbox bridge for Ash sessions")]
struct Args {
    /// Path of the Unix socket to listen on.
    #[arg(long, env = "ASH_BRIDGE_SOCKET")]
    socket: PathBuf,

    /// Agent bundle directory (holds CLAUDE.md).
    #[arg(long, env = "ASH_AGENT_DIR", default_value = ".")]
    agent_dir: PathBuf,

    /// Workspace directory queries run in.
    #[arg(long, env = "ASH_WORKSPACE_DIR", default_value = ".")]
    workspace_dir: PathBuf,

    /// Upstream SDK binary.
    #[arg(long, env = "ASH_SDK_BINARY", default_value = "claude")]
    sdk_binary: String,

    /// Emit a deterministic mock stream instead of calling the SDK.
    #[arg(
        long,
        env = "ASH_MOCK_SDK",
        value_parser = clap::builder::BoolishValueParser::new(),
        default_value = "false"
    )]
    mock_sdk: bool,

    /// Delay between mock frames, for exercising streaming consumers.
    #[arg(long, env = "ASH_MOCK_SDK_DELAY_MS", default_value_t = 0)]
    mock_delay_ms: u64,
}

struct BridgeContext {
    args: Args,
    /// Loaded once at start.
    system_prompt: String,
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

async fn write_event(writer: &SharedWriter, event: &BridgeEvent) -> Result<()> {
    let line = codec::encode(event)?;
    let mut writer = writer.lock().await;
    // write + flush awaits socket-buffer drain, which is the backpressure
    // point between the SDK and the coordinator.
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let system_prompt = std::fs::read_to_string(args.agent_dir.join("CLAUDE.md"))
        .unwrap_or_default();
    if system_prompt.is_empty() {
        warn!("No CLAUDE.md found in {:?}", args.agent_dir);
    }

    if args.socket.exists() {
        let _ = std::fs::remove_file(&args.socket);
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("binding bridge socket at {:?}", args.socket))?;
    info!(
        "ash-bridge listening on {:?} (workspace {:?}, mock={})",
        args.socket, args.workspace_dir, args.mock_sdk
    );

    let ctx = Arc::new(BridgeContext {
        args,
        system_prompt,
    });

    loop {
        let (stream, _) = listener.accept().await.context("accepting connection")?;
        debug!("Bridge connection accepted");
        let ctx = ctx.clone();
        // One connection at a time matches the single-owner client, but a
        // reconnect after a dropped connection must still be served.
        if handle_connection(stream, ctx).await {
            break;
        }
    }

    info!("ash-bridge exiting");
    Ok(())
}

/// Serve one connection. Returns `true` when `shutdown` was received.
async fn handle_connection(stream: UnixStream, ctx: Arc<BridgeContext>) -> bool {
    let (read_half, write_half) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));

    if write_event(&writer, &BridgeEvent::Ready).await.is_err() {
        return false;
    }

    let mut reader = BufReader::new(read_half).lines();
    let mut in_flight: Option<(CancellationToken, tokio::task::JoinHandle<()>)> = None;

    while let Ok(Some(line)) = reader.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let command: BridgeCommand = match codec::decode(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Unparseable command frame: {:?}", e);
                let _ = write_event(
                    &writer,
                    &BridgeEvent::Error {
                        error: format!("unparseable command: {}", e),
                    },
                )
                .await;
                continue;
            }
        };

        match command {
            BridgeCommand::Interrupt => {
                if let Some((token, _)) = &in_flight {
                    info!("Interrupt received, cancelling query");
                    token.cancel();
                } else {
                    debug!("Interrupt with no query in flight");
                }
            }
            BridgeCommand::Shutdown => {
                info!("Shutdown received");
                if let Some((token, handle)) = in_flight.take() {
                    token.cancel();
                    let _ = handle.await;
                }
                return true;
            }
            BridgeCommand::Query {
                prompt,
                session_id,
                include_partial_messages,
                model,
            } => {
                if query_active(&mut in_flight) {
                    let _ = write_event(
                        &writer,
                        &BridgeEvent::Error {
                            error: "a query is already in flight".to_string(),
                        },
                    )
                    .await;
                    continue;
                }
                in_flight = Some(start_query(
                    ctx.clone(),
                    writer.clone(),
                    QueryJob {
                        prompt: Some(prompt),
                        session_id,
                        include_partial: include_partial_messages.unwrap_or(false),
                        model,
                    },
                ));
            }
            BridgeCommand::Resume { session_id } => {
                if query_active(&mut in_flight) {
                    let _ = write_event(
                        &writer,
                        &BridgeEvent::Error {
                            error: "a query is already in flight".to_string(),
                        },
                    )
                    .await;
                    continue;
                }
                in_flight = Some(start_query(
                    ctx.clone(),
                    writer.clone(),
                    QueryJob {
                        prompt: None,
                        session_id,
                        include_partial: false,
                        model: None,
                    },
                ));
            }
            BridgeCommand::Exec {
                command,
                timeout_ms,
            } => {
                // Commands run one at a time: drain the query first.
                if let Some((_, handle)) = in_flight.take() {
                    let _ = handle.await;
                }
                let event = run_exec(&ctx, &command, timeout_ms).await;
                if write_event(&writer, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some((token, handle)) = in_flight.take() {
        token.cancel();
        let _ = handle.await;
    }
    debug!("Bridge connection closed");
    false
}

fn query_active(
    in_flight: &mut Option<(CancellationToken, tokio::task::JoinHandle<()>)>,
) -> bool {
    if let Some((_, handle)) = in_flight {
        if handle.is_finished() {
            *in_flight = None;
            return false;
        }
        return true;
    }
    false
}

struct QueryJob {
    prompt: Option<String>,
    session_id: String,
    include_partial: bool,
    model: Option<String>,
}

fn start_query(
    ctx: Arc<BridgeContext>,
    writer: SharedWriter,
    job: QueryJob,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        let session_id = job.session_id.clone();
        if ctx.args.mock_sdk {
            run_mock_query(&ctx, &writer, &job, &task_token).await;
        } else if let Err(e) = run_sdk_query(&ctx, &writer, &job, &task_token).await {
            error!("SDK query failed: {:?}", e);
            let _ = write_event(
                &writer,
                &BridgeEvent::Error {
                    error: e.to_string(),
                },
            )
            .await;
        }
        // `done` is emitted even after interrupt or failure.
        let _ = write_event(&writer, &BridgeEvent::Done { session_id }).await;
    });
    (token, handle)
}

/// Drive the upstream SDK as a child process streaming NDJSON messages.
async fn run_sdk_query(
    ctx: &BridgeContext,
    writer: &SharedWriter,
    job: &QueryJob,
    token: &CancellationToken,
) -> Result<()> {
    let mut cmd = Command::new(&ctx.args.sdk_binary);
    cmd.arg("--print")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .current_dir(&ctx.args.workspace_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if !ctx.system_prompt.is_empty() {
        cmd.arg("--append-system-prompt").arg(&ctx.system_prompt);
    }
    if job.include_partial {
        cmd.arg("--include-partial-messages");
    }
    if let Some(ref model) = job.model {
        cmd.arg("--model").arg(model);
    }
    match &job.prompt {
        Some(prompt) => {
            cmd.arg(prompt);
        }
        None => {
            cmd.arg("--resume").arg(&job.session_id).arg("");
        }
    }

    let mut child = cmd.spawn().context("spawning upstream SDK")?;
    let stdout = child.stdout.take().context("SDK has no stdout")?;

    // Forward stderr as log events.
    if let Some(stderr) = child.stderr.take() {
        let writer = writer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = write_event(
                    &writer,
                    &BridgeEvent::Log {
                        level: LogLevel::Stderr,
                        text: line,
                        ts: now_rfc3339(),
                    },
                )
                .await;
            }
        });
    }

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Query cancelled, killing SDK child");
                let _ = child.kill().await;
                return Ok(());
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            // Passthrough: the message is never reshaped.
                            Ok(data) => {
                                write_event(writer, &BridgeEvent::Message { data }).await?;
                            }
                            Err(e) => {
                                warn!("Non-JSON SDK output: {:?}", e);
                                let _ = write_event(
                                    writer,
                                    &BridgeEvent::Log {
                                        level: LogLevel::Stdout,
                                        text: line,
                                        ts: now_rfc3339(),
                                    },
                                )
                                .await;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("SDK stdout read failed: {:?}", e);
                        break;
                    }
                }
            }
        }
    }

    let status = child.wait().await.context("waiting for SDK")?;
    if !status.success() {
        anyhow::bail!("upstream SDK exited with {}", status);
    }
    Ok(())
}

/// Deterministic stand-in for the SDK used by tests and development.
async fn run_mock_query(
    ctx: &BridgeContext,
    writer: &SharedWriter,
    job: &QueryJob,
    token: &CancellationToken,
) {
    let prompt = job.prompt.clone().unwrap_or_default();
    let reply = format!("Mock reply to: {}", prompt);

    let mut frames: Vec<Value> = vec![json!({
        "type": "system",
        "subtype": "init",
        "session_id": job.session_id,
        "model": job.model.clone().unwrap_or_else(|| "mock".to_string()),
        "system_prompt_bytes": ctx.system_prompt.len(),
    })];

    if job.include_partial {
        for chunk in ["Mock ", "reply"] {
            frames.push(json!({
                "type": "stream_event",
                "event": {
                    "type": "content_block_delta",
                    "delta": { "type": "text_delta", "text": chunk }
                }
            }));
        }
    }

    frames.push(json!({
        "type": "assistant",
        "message": { "role": "assistant", "content": [ { "type": "text", "text": reply } ] }
    }));
    frames.push(json!({
        "type": "result",
        "num_turns": 1,
        "result": reply,
        "is_error": false,
    }));

    let delay = std::time::Duration::from_millis(ctx.args.mock_delay_ms);
    for frame in frames {
        if token.is_cancelled() {
            return;
        }
        if !delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if write_event(writer, &BridgeEvent::Message { data: frame })
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Run one shell command in the workspace with a timeout.
async fn run_exec(ctx: &BridgeContext, command: &str, timeout_ms: Option<u64>) -> BridgeEvent {
    let timeout = std::time::Duration::from_millis(timeout_ms.unwrap_or(30_000));
    debug!("exec ({}ms budget): {}", timeout.as_millis(), command);

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&ctx.args.workspace_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return BridgeEvent::ExecResult {
                exit_code: 127,
                stdout: String::new(),
                stderr: format!("spawn failed: {}", e),
            };
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => BridgeEvent::ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Ok(Err(e)) => BridgeEvent::ExecResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("exec failed: {}", e),
        },
        Err(_) => BridgeEvent::ExecResult {
            // Same convention as timeout(1).
            exit_code: 124,
            stdout: String::new(),
            stderr: format!("command timed out after {}ms", timeout.as_millis()),
        },
    }
}
