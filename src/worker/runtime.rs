//! Worker process main loop
//!
//! Runs inside `twinview worker`. Commands arrive as JSON lines on stdin;
//! stdin closing means the parent is gone.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Timelike;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::command::WorkerCommand;
use super::led::{Flow, LedController};
use crate::config::LedConfig;
use crate::error::{AppError, Result};

/// Commands applied per loop iteration
pub const MAX_COMMANDS_PER_TICK: usize = 10;
/// Loop pause while animating (~30 fps)
pub const ACTIVE_PAUSE: Duration = Duration::from_millis(33);
/// Loop pause while idle
pub const IDLE_PAUSE: Duration = Duration::from_millis(100);
/// How often the active-hours window is re-evaluated
pub const HOURS_CHECK_INTERVAL: Duration = Duration::from_secs(60);

const COMMAND_BUFFER: usize = 64;

/// Why the worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `Shutdown` command received
    Shutdown,
    /// Command stream closed
    ParentGone,
    /// SIGTERM or SIGINT
    Signal,
}

/// Forward JSON-line commands from `reader` into a channel
///
/// Lines that do not parse are logged and skipped. The channel closes
/// when the reader hits EOF or fails.
pub fn spawn_command_reader<R>(reader: R) -> (mpsc::Receiver<WorkerCommand>, JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let handle = tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WorkerCommand>(line) {
                        Ok(cmd) => {
                            if tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed command {:?}: {}", line, e),
                    }
                }
                Ok(None) => {
                    debug!("Command stream closed");
                    break;
                }
                Err(e) => {
                    warn!("Command stream read failed: {}", e);
                    break;
                }
            }
        }
    });
    (rx, handle)
}

/// LED worker state machine, driven one tick at a time
pub struct WorkerRuntime {
    leds: LedController,
    commands: mpsc::Receiver<WorkerCommand>,
    last_hours_check: Option<Instant>,
}

impl WorkerRuntime {
    pub fn new(leds: LedController, commands: mpsc::Receiver<WorkerCommand>) -> Self {
        Self {
            leds,
            commands,
            last_hours_check: None,
        }
    }

    pub fn leds(&self) -> &LedController {
        &self.leds
    }

    /// One iteration: drain commands, refresh hours, animate
    ///
    /// Returns the exit reason once the loop should stop.
    pub fn tick(&mut self, now: Instant, hour: impl FnOnce() -> u32) -> Option<WorkerExit> {
        for _ in 0..MAX_COMMANDS_PER_TICK {
            match self.commands.try_recv() {
                Ok(cmd) => {
                    if self.leds.apply(cmd) == Flow::Shutdown {
                        info!("Shutdown command received");
                        return Some(WorkerExit::Shutdown);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("Parent gone, stopping");
                    return Some(WorkerExit::ParentGone);
                }
            }
        }

        let due = self
            .last_hours_check
            .map_or(true, |last| now.duration_since(last) >= HOURS_CHECK_INTERVAL);
        if due {
            self.last_hours_check = Some(now);
            self.leds.update_hours(hour());
        }

        self.leds.animate_all(now);
        None
    }

    /// Pause before the next tick
    pub fn pause(&self) -> Duration {
        if self.leds.should_animate() {
            ACTIVE_PAUSE
        } else {
            IDLE_PAUSE
        }
    }

    /// Tick until a command, channel close or `stop` ends the loop
    ///
    /// All strands are turned off before returning.
    pub async fn run<F>(mut self, stop: F) -> WorkerExit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        let exit = loop {
            if let Some(exit) = self.tick(Instant::now(), local_hour) {
                break exit;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.pause()) => {}
                _ = &mut stop => {
                    info!("Termination signal received");
                    break WorkerExit::Signal;
                }
            }
        };

        self.leds.turn_off_all();
        exit
    }
}

fn local_hour() -> u32 {
    chrono::Local::now().hour()
}

/// Entry point of `twinview worker`
pub async fn run_worker(config: LedConfig) -> Result<()> {
    let pid = std::process::id();
    async move {
        info!("LED worker starting with {} strands", config.strands.len());

        let leds = LedController::with_logging_drivers(&config)?;
        let (commands, reader) = spawn_command_reader(BufReader::new(tokio::io::stdin()));

        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let stop = async move {
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
        };

        let exit = WorkerRuntime::new(leds, commands).run(stop).await;
        reader.abort();
        info!("LED worker stopped ({:?})", exit);
        Ok::<(), AppError>(())
    }
    .instrument(info_span!("worker", pid))
    .await
}
