use std::io::BufRead;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use voicebot_contracts::EventReport;

use crate::engine::{Engine, EngineError, EngineInput};

const QUEUE_DEPTH: usize = 256;

type ReplyTx = oneshot::Sender<Result<EventReport, EngineError>>;

enum Message {
    Input(EngineInput, ReplyTx),
    Shutdown,
}

/// Submits inputs to the single engine task. Cheap to clone; every producer
/// (HTTP ingress, console, sweep ticker) holds one.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Message>,
}

impl EngineHandle {
    pub async fn submit(&self, input: EngineInput) -> Result<EventReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Message::Input(input, reply_tx))
            .await
            .map_err(|_| EngineError::Unavailable)?;
        reply_rx.await.map_err(|_| EngineError::Unavailable)?
    }

    /// For producers running on plain threads.
    pub fn blocking_submit(&self, input: EngineInput) -> Result<EventReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(Message::Input(input, reply_tx))
            .map_err(|_| EngineError::Unavailable)?;
        reply_rx.blocking_recv().map_err(|_| EngineError::Unavailable)?
    }

    /// Inputs already queued are still processed, then state is flushed.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown).await;
    }
}

pub fn spawn_engine(engine: Engine) -> (EngineHandle, JoinHandle<Engine>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let task = tokio::spawn(run(engine, rx));
    (EngineHandle { tx }, task)
}

async fn run(mut engine: Engine, mut rx: mpsc::Receiver<Message>) -> Engine {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Input(input, reply) => {
                let result = engine.handle(input).await;
                let _ = reply.send(result);
            }
            Message::Shutdown => {
                rx.close();
                while let Some(message) = rx.recv().await {
                    if let Message::Input(input, reply) = message {
                        let _ = reply.send(engine.handle(input).await);
                    }
                }
                break;
            }
        }
    }
    match engine.flush() {
        Ok(()) => info!("state flushed"),
        Err(err) => error!(error = %err, "final flush failed"),
    }
    engine
}

pub fn spawn_sweeper(handle: EngineHandle, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match handle.submit(EngineInput::Sweep { at: Utc::now() }).await {
                Ok(report) if !report.mode_changes.is_empty() => {
                    info!(
                        voiced = report.voiced().len(),
                        devoiced = report.devoiced().len(),
                        attempted = report.mode_changes.len(),
                        "sweep"
                    );
                }
                Ok(_) => {}
                Err(EngineError::Unavailable) => break,
                Err(err) => warn!(error = %err, "sweep failed"),
            }
        }
        debug!("sweeper stopped");
    })
}

/// Reads operator commands from standard input on a dedicated thread and
/// prints the replies to standard error. Stops at end of input.
pub fn spawn_console(handle: EngineHandle) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("voicebot-console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "console read failed");
                        break;
                    }
                };
                match handle.blocking_submit(EngineInput::Console {
                    line,
                    at: Utc::now(),
                }) {
                    Ok(report) => {
                        for reply in report.replies {
                            eprintln!("{}", reply.text);
                        }
                    }
                    Err(EngineError::Unavailable) => break,
                    Err(err) => eprintln!("error: {err}"),
                }
            }
            debug!("console input closed");
        })
}
