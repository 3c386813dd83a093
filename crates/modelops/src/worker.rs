//! Subprocess runtime: every loaded model lives in its own worker process
//! speaking NDJSON over stdin/stdout. Releasing a model ends the process,
//! which hands all of its device memory back to the driver.
//!
//! The child and its pipes are owned by a dedicated task. Callers talk to it
//! over a channel, so a caller that goes away mid-request can never leave a
//! half-written line on the worker's stdin.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use base64::Engine;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::runtime::{
    ChatContent, ChatMessage, GenerationParams, LoadRequest, LoadedModel, Role, RuntimeInfo,
    TokenizerInfo, VisionRuntime,
};
use crate::schema::Device;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const SESSION_QUEUE: usize = 8;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub python: String,
    pub script: PathBuf,
    pub load_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    #[serde(rename = "ready")]
    Ready {
        tokenizer: Option<String>,
        device: Option<String>,
    },
    #[serde(rename = "log")]
    Log {
        level: Option<String>,
        message: String,
    },
    #[serde(rename = "ack")]
    Ack { id: u64 },
    #[serde(rename = "result")]
    Output { id: u64, output: serde_json::Value },
    #[serde(rename = "error")]
    Error {
        id: Option<u64>,
        message: String,
        trace: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerCommand {
    Eval { id: u64 },
    Offload { id: u64 },
    Chat {
        id: u64,
        msgs: Vec<WireMessage>,
        params: GenerationParams,
    },
    Shutdown,
}

impl WorkerCommand {
    fn id(&self) -> Option<u64> {
        match self {
            WorkerCommand::Eval { id } | WorkerCommand::Offload { id } | WorkerCommand::Chat { id, .. } => Some(*id),
            WorkerCommand::Shutdown => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: Vec<WireContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    Image { png_b64: String },
    Text { text: String },
}

fn encode_png(img: &RgbImage) -> anyhow::Result<String> {
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .context("failed to encode image as png")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
}

fn to_wire(msgs: &[ChatMessage]) -> anyhow::Result<Vec<WireMessage>> {
    msgs.iter()
        .map(|m| {
            let content = m
                .content
                .iter()
                .map(|c| match c {
                    ChatContent::Image(img) => Ok(WireContent::Image { png_b64: encode_png(img)? }),
                    ChatContent::Text(text) => Ok(WireContent::Text { text: text.clone() }),
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(WireMessage { role: m.role, content })
        })
        .collect()
}

fn log_worker_line(model: &str, level: Option<&str>, message: &str) {
    match level.unwrap_or("info") {
        "error" | "critical" => error!(model = %model, source = "worker", "{message}"),
        "warn" | "warning" => warn!(model = %model, source = "worker", "{message}"),
        "debug" => debug!(model = %model, source = "worker", "{message}"),
        _ => info!(model = %model, source = "worker", "{message}"),
    }
}

fn parse_event(model: &str, line: &str) -> Option<WorkerEvent> {
    match serde_json::from_str::<WorkerEvent>(line) {
        Ok(ev) => Some(ev),
        Err(_) => {
            debug!(model = %model, line = %line, "worker: non-json stdout line");
            None
        }
    }
}

fn worker_error(message: String, trace: Option<String>) -> anyhow::Error {
    match trace {
        Some(trace) => anyhow!("{message}\n{trace}"),
        None => anyhow!(message),
    }
}

struct Ready {
    tokenizer: TokenizerInfo,
    device: Option<Device>,
}

async fn wait_ready(lines: &mut Lines<BufReader<ChildStdout>>, model: &str) -> anyhow::Result<Ready> {
    while let Some(line) = lines.next_line().await.context("worker stdout read failed")? {
        let Some(event) = parse_event(model, &line) else { continue };
        match event {
            WorkerEvent::Ready { tokenizer, device } => {
                info!(model = %model, device = ?device, tokenizer = ?tokenizer, "worker: ready");
                let reported = device.as_deref().and_then(Device::from_reported);
                if device.is_some() && reported.is_none() {
                    warn!(model = %model, device = ?device, "worker: unrecognized device name");
                }
                return Ok(Ready {
                    tokenizer: TokenizerInfo { kind: tokenizer },
                    device: reported,
                });
            }
            WorkerEvent::Error { message, trace, .. } => return Err(worker_error(message, trace)),
            WorkerEvent::Log { level, message } => log_worker_line(model, level.as_deref(), &message),
            other => debug!(model = %model, ?other, "worker: unexpected event before ready"),
        }
    }
    bail!("worker exited before reporting ready")
}

pub struct WorkerRuntime {
    opts: WorkerOptions,
}

impl WorkerRuntime {
    pub fn new(opts: WorkerOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl VisionRuntime for WorkerRuntime {
    async fn load(&self, req: &LoadRequest) -> anyhow::Result<Box<dyn LoadedModel>> {
        let mut cmd = Command::new(&self.opts.python);
        cmd.arg(&self.opts.script)
            .arg("--model-dir")
            .arg(&req.dir)
            .arg("--dtype")
            .arg(req.placement.precision.as_str())
            .arg("--device-map")
            .arg(req.placement.device_map.as_str());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", self.opts.script.display()))?;
        let stdin = child.stdin.take().context("worker stdin not piped")?;
        let stdout = child.stdout.take().context("worker stdout not piped")?;

        // Capture stderr too
        if let Some(stderr) = child.stderr.take() {
            let model = req.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(model = %model, source = "stderr", "{line}");
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let ready = match tokio::time::timeout(self.opts.load_timeout, wait_ready(&mut lines, &req.name)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                bail!("worker not ready after {}s", self.opts.load_timeout.as_secs());
            }
        };

        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let io = WorkerIo {
            name: req.name.clone(),
            child,
            stdin,
            stdout: lines,
            gone: false,
        };
        tokio::spawn(io.run(rx));

        Ok(Box::new(WorkerSession {
            name: req.name.clone(),
            tokenizer: ready.tokenizer,
            device: ready.device,
            next_id: 0,
            tx,
        }))
    }

    fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            name: "worker".to_string(),
            command: format!("{} {}", self.opts.python, self.opts.script.display()),
        }
    }
}

type Reply = anyhow::Result<Option<serde_json::Value>>;

enum SessionRequest {
    Call {
        cmd: WorkerCommand,
        reply: oneshot::Sender<Reply>,
    },
    Shutdown {
        done: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Owns the child process and its pipes for the lifetime of a session.
struct WorkerIo {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// Set once a pipe broke; the worker is not coming back.
    gone: bool,
}

impl WorkerIo {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionRequest>) {
        loop {
            tokio::select! {
                req = rx.recv() => match req {
                    Some(SessionRequest::Call { cmd, reply }) => {
                        let res = self.call(&cmd).await;
                        if self.gone {
                            // close before replying so the handle reads as dead right away
                            rx.close();
                        }
                        let _ = reply.send(res);
                        if self.gone {
                            break;
                        }
                    }
                    Some(SessionRequest::Shutdown { done }) => {
                        rx.close();
                        let _ = done.send(self.shutdown().await);
                        return;
                    }
                    None => {
                        debug!(model = %self.name, "worker: session dropped without release");
                        break;
                    }
                },
                status = self.child.wait() => {
                    rx.close();
                    match status {
                        Ok(status) => warn!(model = %self.name, %status, "worker: exited unexpectedly"),
                        Err(e) => warn!(model = %self.name, "worker: wait failed: {e}"),
                    }
                    return;
                }
            }
        }
        if let Err(e) = self.child.kill().await {
            debug!(model = %self.name, "worker: kill failed: {e}");
        }
    }

    async fn call(&mut self, cmd: &WorkerCommand) -> Reply {
        self.send(cmd).await?;
        match cmd.id() {
            Some(id) => self.await_reply(id).await,
            None => Ok(None),
        }
    }

    async fn send(&mut self, cmd: &WorkerCommand) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(cmd)?;
        line.push(b'\n');
        if let Err(e) = write_line(&mut self.stdin, &line).await {
            self.gone = true;
            return Err(e).context("worker stdin closed");
        }
        Ok(())
    }

    /// Reads until the reply for `id` shows up. Acks carry no payload.
    async fn await_reply(&mut self, id: u64) -> Reply {
        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.gone = true;
                    bail!("worker for {} exited", self.name);
                }
                Err(e) => {
                    self.gone = true;
                    return Err(e).context("worker stdout read failed");
                }
            };
            let Some(event) = parse_event(&self.name, &line) else { continue };
            match event {
                WorkerEvent::Ack { id: got } if got == id => return Ok(None),
                WorkerEvent::Output { id: got, output } if got == id => return Ok(Some(output)),
                WorkerEvent::Error { id: got, message, trace } if got.map_or(true, |g| g == id) => {
                    return Err(worker_error(message, trace));
                }
                WorkerEvent::Log { level, message } => {
                    log_worker_line(&self.name, level.as_deref(), &message)
                }
                other => debug!(model = %self.name, ?other, "worker: skipping stale event"),
            }
        }
    }

    async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Err(e) = self.send(&WorkerCommand::Shutdown).await {
            warn!(model = %self.name, "worker: shutdown request not delivered: {e:#}");
        }
        let WorkerIo { name, mut child, stdin, .. } = self;
        drop(stdin);

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!(model = %name, %status, "worker: exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e).context("waiting for worker exit failed"),
            Err(_) => {
                warn!(model = %name, "worker: no exit after shutdown, killing");
                child.kill().await.context("failed to kill worker")
            }
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> std::io::Result<()> {
    stdin.write_all(line).await?;
    stdin.flush().await
}

/// Caller-side handle to a worker process.
pub struct WorkerSession {
    name: String,
    tokenizer: TokenizerInfo,
    device: Option<Device>,
    next_id: u64,
    tx: mpsc::Sender<SessionRequest>,
}

impl WorkerSession {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    async fn request(&mut self, cmd: WorkerCommand) -> Reply {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Call { cmd, reply })
            .await
            .map_err(|_| anyhow!("worker for {} is gone", self.name))?;
        rx.await.map_err(|_| anyhow!("worker for {} exited", self.name))?
    }
}

#[async_trait]
impl LoadedModel for WorkerSession {
    fn tokenizer(&self) -> &TokenizerInfo {
        &self.tokenizer
    }

    fn device(&self) -> Option<Device> {
        self.device
    }

    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn set_inference_mode(&mut self) -> anyhow::Result<()> {
        let id = self.next_id();
        self.request(WorkerCommand::Eval { id }).await?;
        Ok(())
    }

    async fn chat(
        &mut self,
        msgs: &[ChatMessage],
        params: &GenerationParams,
    ) -> anyhow::Result<serde_json::Value> {
        let id = self.next_id();
        let msgs = to_wire(msgs)?;
        self.request(WorkerCommand::Chat { id, msgs, params: params.clone() })
            .await?
            .ok_or_else(|| anyhow!("worker acknowledged chat {id} without output"))
    }

    async fn offload(&mut self) -> anyhow::Result<()> {
        let id = self.next_id();
        self.request(WorkerCommand::Offload { id }).await?;
        Ok(())
    }

    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        if self.tx.send(SessionRequest::Shutdown { done }).await.is_err() {
            debug!(model = %self.name, "worker: already exited");
            return Ok(());
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => {
                debug!(model = %self.name, "worker: exited before shutdown");
                Ok(())
            }
        }
    }
}
