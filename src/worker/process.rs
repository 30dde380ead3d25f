//! Worker instances as child processes of this binary

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::WorkerCommand;
use super::supervisor::{WorkerLauncher, WorkerProcess};
use crate::config::LedConfig;
use crate::error::{AppError, Result};

/// Launches a worker process and writes commands to its stdin as JSON lines
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Launcher running `program` as an LED worker
    pub fn for_worker(
        program: impl Into<PathBuf>,
        leds: &LedConfig,
        log_level: &str,
    ) -> Result<Self> {
        Ok(Self::new(program, worker_args(leds, log_level)?))
    }

    /// Launcher for the currently running executable
    pub fn current_exe(leds: &LedConfig, log_level: &str) -> Result<Self> {
        Self::for_worker(std::env::current_exe()?, leds, log_level)
    }
}

fn worker_args(leds: &LedConfig, log_level: &str) -> Result<Vec<String>> {
    Ok(vec![
        "--log-level".to_string(),
        log_level.to_string(),
        "worker".to_string(),
        "--leds".to_string(),
        serde_json::to_string(leds)?,
    ])
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        commands: mpsc::Receiver<WorkerCommand>,
    ) -> Result<Box<dyn WorkerProcess>> {
        debug!("Spawning worker: {:?}", self.program);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Worker(format!("Failed to spawn {:?}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Worker("worker stdin not captured".to_string()))?;
        let pump = tokio::spawn(pump_commands(commands, stdin));

        info!("Worker process spawned with PID {:?}", child.id());
        Ok(Box::new(ChildWorker { child, pump }))
    }
}

/// Forward queued commands to the worker as JSON lines
async fn pump_commands(mut commands: mpsc::Receiver<WorkerCommand>, mut stdin: ChildStdin) {
    while let Some(command) = commands.recv().await {
        let mut line = match serde_json::to_vec(&command) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize {}: {}", command.name(), e);
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            debug!("Worker stdin closed: {}", e);
            return;
        }
        if let Err(e) = stdin.flush().await {
            debug!("Worker stdin flush failed: {}", e);
            return;
        }
    }
}

struct ChildWorker {
    child: Child,
    pump: JoinHandle<()>,
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("Worker exited with {}", status);
                false
            }
            Err(e) => {
                warn!("Failed to query worker status: {}", e);
                false
            }
        }
    }

    async fn terminate(&mut self, timeout: Duration) {
        self.pump.abort();

        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to worker {} failed: {}", pid, e);
            }
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => info!("Worker exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for worker: {}", e),
            Err(_) => {
                warn!("Worker did not exit within {:?}, killing", timeout);
                // kill() sends SIGKILL and reaps
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill worker: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProcessLauncher {
        ProcessLauncher::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_worker_args_carry_led_config() {
        let args = worker_args(&LedConfig::default(), "debug").unwrap();
        assert_eq!(&args[..4], ["--log-level", "debug", "worker", "--leds"]);
        let leds: LedConfig = serde_json::from_str(&args[4]).unwrap();
        assert_eq!(leds, LedConfig::default());
    }

    #[tokio::test]
    async fn test_commands_reach_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("commands.txt");
        let launcher = shell(&format!("cat > {}", out.display()));

        let (tx, rx) = mpsc::channel(4);
        let mut worker = launcher.launch(rx).await.unwrap();
        assert!(worker.id().is_some());
        assert!(worker.is_alive());

        tx.send(WorkerCommand::SetPeopleCount { count: 2 }).await.unwrap();
        drop(tx);

        // cat exits on EOF once the pump finishes
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.is_alive() {
            assert!(std::time::Instant::now() < deadline, "worker did not exit");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "{\"type\":\"set_people_count\",\"count\":2}\n");
    }

    #[tokio::test]
    async fn test_terminate_kills_stubborn_worker() {
        let launcher = shell("trap '' TERM; while true; do sleep 1; done");

        let (_tx, rx) = mpsc::channel(4);
        let mut worker = launcher.launch(rx).await.unwrap();
        worker.terminate(Duration::from_millis(200)).await;
        assert!(!worker.is_alive());
    }
}
