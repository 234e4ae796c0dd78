//! Component C5: the bi-directional push channel to an external dashboard.
//!
//! Transport is a persistent websocket connection (`tungstenite`, the sync
//! client, to stay in the same fully-threaded concurrency model the rest of
//! the engine uses rather than pulling in an async runtime for one
//! component). A background thread owns the socket: it sends a heartbeat
//! every 5 seconds, drains any outbound events queued by the engine, and
//! forwards inbound `retry_job` commands to the Processor over an
//! `mpsc` channel. Disconnected state never blocks callers — outbound sends
//! go through a bounded queue and are dropped with a warning if the
//! connection is down.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use crate::error::NotifierError;
use crate::job::{Job, JobStatus};

const RECONNECT_BACKOFF: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const SOCKET_POLL_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub enum NotifierCommand {
    RetryJob(String),
}

#[derive(Debug, Serialize)]
#[serde(tag = "method", content = "args")]
enum OutboundEvent {
    SendSystemStatusUpdate { state: String, msg: String },
    SendJobUpdate { id: String, status: String, msg: String },
    SendQueueUpdate { payload: serde_json::Value },
    SendLogUpdate { line: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "args")]
enum InboundCommand {
    ReceiveRetryJobCommand { job_id: String },
}

/// Handle shared by every component that emits Notifier events. Cloning is
/// cheap (an `Arc` internally); sends never block the caller.
pub struct Notifier {
    outbound: Option<mpsc::Sender<OutboundEvent>>,
}

impl Notifier {
    /// Starts the background connection thread and returns the handle plus
    /// the receiving end of inbound retry commands.
    pub fn spawn(cancel: Arc<AtomicBool>) -> (Arc<Self>, mpsc::Receiver<NotifierCommand>) {
        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundEvent>();
        let (inbound_tx, inbound_rx) = mpsc::channel::<NotifierCommand>();

        let notifier = Arc::new(Self {
            outbound: Some(outbound_tx),
        });
        let notifier_for_thread = Arc::clone(&notifier);
        std::thread::spawn(move || connection_loop(notifier_for_thread, outbound_rx, inbound_tx, cancel));

        (notifier, inbound_rx)
    }

    /// A handle that drops every event on the floor. Used in tests that
    /// exercise the Processor without a live dashboard connection.
    pub fn disabled() -> Self {
        Self { outbound: None }
    }

    fn send(&self, event: OutboundEvent) {
        if let Some(tx) = &self.outbound {
            if tx.send(event).is_err() {
                tracing::warn!("notifier outbound channel closed, event dropped");
            }
        }
    }

    pub fn system_status(&self, state: &str, msg: &str) {
        self.send(OutboundEvent::SendSystemStatusUpdate {
            state: state.to_string(),
            msg: msg.to_string(),
        });
    }

    pub fn job_update(&self, job_id: &str, status: JobStatus, msg: &str) {
        self.send(OutboundEvent::SendJobUpdate {
            id: job_id.to_string(),
            status: status.as_str().to_string(),
            msg: msg.to_string(),
        });
    }

    pub fn queue_update(&self, jobs: &[Job]) {
        let payload = serde_json::to_value(jobs).unwrap_or(serde_json::Value::Null);
        self.send(OutboundEvent::SendQueueUpdate { payload });
    }

    pub fn log_update(&self, line: &str) {
        self.send(OutboundEvent::SendLogUpdate { line: line.to_string() });
    }
}

/// Ranked candidate endpoints: an environment override first, then fixed
/// development URLs (§4.5/§6).
fn candidate_endpoints() -> Vec<String> {
    let mut candidates = Vec::new();
    if let Ok(url) = std::env::var("FILEJOBROUTER_WEBUI_URL") {
        candidates.push(url);
    }
    candidates.push("ws://localhost:5000/hubs/dispatch".to_string());
    candidates.push("ws://127.0.0.1:5000/hubs/dispatch".to_string());
    candidates
}

fn connection_loop(
    notifier: Arc<Notifier>,
    outbound_rx: mpsc::Receiver<OutboundEvent>,
    inbound_tx: mpsc::Sender<NotifierCommand>,
    cancel: Arc<AtomicBool>,
) {
    let mut backoff_index = 0usize;

    while !cancel.load(Ordering::Relaxed) {
        let endpoints = candidate_endpoints();
        if endpoints.is_empty() {
            tracing::error!("{}", NotifierError::NoEndpoint);
        }
        let mut connected = false;

        for endpoint in &endpoints {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            match connect(endpoint) {
                Ok(socket) => {
                    connected = true;
                    backoff_index = 0;
                    tracing::info!(endpoint, "notifier connected");
                    notifier.log_update(&format!("connected to {endpoint}"));
                    run_session(socket, &outbound_rx, &inbound_tx, &cancel);
                    tracing::warn!(endpoint, "notifier disconnected");
                    notifier.log_update(&format!("disconnected from {endpoint}"));
                    break;
                }
                Err(e) => {
                    tracing::warn!(endpoint, "notifier connect failed: {e}");
                    notifier.log_update(&format!("connect to {endpoint} failed: {e}"));
                }
            }
        }

        if cancel.load(Ordering::Relaxed) {
            return;
        }

        let wait = RECONNECT_BACKOFF[backoff_index.min(RECONNECT_BACKOFF.len() - 1)];
        backoff_index += 1;
        if !connected {
            std::thread::sleep(wait.max(Duration::from_millis(1)));
        } else {
            std::thread::sleep(wait);
        }
    }
}

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

fn connect(endpoint: &str) -> Result<Socket, NotifierError> {
    let url = Url::parse(endpoint).map_err(|e| {
        NotifierError::WebSocket(tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            e.to_string(),
        )))
    })?;
    let (socket, _response) = tungstenite::connect(url)?;
    if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
        let _ = stream.set_read_timeout(Some(SOCKET_POLL_TIMEOUT));
    }
    Ok(socket)
}

/// Drives one live connection: heartbeats, outbound drain, inbound parse.
/// Returns once the socket errors out or the cancellation token is set.
fn run_session(
    mut socket: Socket,
    outbound_rx: &mpsc::Receiver<OutboundEvent>,
    inbound_tx: &mpsc::Sender<NotifierCommand>,
    cancel: &AtomicBool,
) {
    let mut last_heartbeat = Instant::now() - HEARTBEAT_INTERVAL;

    loop {
        if cancel.load(Ordering::Relaxed) {
            let _ = socket.close(None);
            return;
        }

        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            if send_event(
                &mut socket,
                &OutboundEvent::SendSystemStatusUpdate {
                    state: "Alive".to_string(),
                    msg: String::new(),
                },
            )
            .is_err()
            {
                return;
            }
            last_heartbeat = Instant::now();
        }

        while let Ok(event) = outbound_rx.try_recv() {
            if send_event(&mut socket, &event).is_err() {
                return;
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                if let Ok(InboundCommand::ReceiveRetryJobCommand { job_id }) = serde_json::from_str(&text) {
                    let _ = inbound_tx.send(NotifierCommand::RetryJob(job_id));
                }
            }
            Ok(Message::Close(_)) => return,
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // No message within the poll window; loop back to heartbeat/drain.
            }
            Err(e) => {
                tracing::warn!("notifier read error: {e}");
                return;
            }
        }
    }
}

fn send_event(socket: &mut Socket, event: &OutboundEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(t) => t,
        Err(_) => return Ok(()),
    };
    match socket.send(Message::Text(text)) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!("notifier send failed: {e}");
            Err(())
        }
    }
}
