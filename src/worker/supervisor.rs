//! Crash-detecting supervisor for the LED worker process

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::command::{CommandQueue, WorkerCommand};
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::events::SystemEvent;
use crate::state::RunContext;

/// A running worker instance
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Non-blocking liveness probe
    fn is_alive(&mut self) -> bool;

    /// Stop the worker: polite request first, forced kill after `timeout`
    async fn terminate(&mut self, timeout: Duration);
}

/// Starts worker instances fed by a command receiver
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        commands: mpsc::Receiver<WorkerCommand>,
    ) -> Result<Box<dyn WorkerProcess>>;
}

/// Published on the event bus after a dead worker was replaced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartNotice {
    pub pid: Option<u32>,
    pub generation: u64,
    pub restarted_at: DateTime<Utc>,
}

/// Supervisor timing
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub queue_capacity: usize,
    pub monitor_interval: Duration,
    /// Delay between launch and the first command
    pub settle: Duration,
    /// Time the worker gets to act on TurnOffAll/Shutdown
    pub shutdown_grace: Duration,
    /// Wait after the polite stop before killing
    pub terminate_timeout: Duration,
}

impl From<&WorkerConfig> for SupervisorConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            monitor_interval: config.monitor_interval(),
            settle: config.settle(),
            shutdown_grace: config.shutdown_grace(),
            terminate_timeout: config.terminate_timeout(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// Worker state exposed to the preview server
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub generation: u64,
    pub restarts: u64,
    pub last_restart: Option<DateTime<Utc>>,
}

pub type SharedWorkerStatus = Arc<RwLock<WorkerStatus>>;

/// One live worker; replaced, never reused, after a crash
pub struct WorkerHandle {
    process: Box<dyn WorkerProcess>,
    queue: CommandQueue,
    started_at: Instant,
    generation: u64,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }
}

/// Keeps exactly one worker alive and its state in sync
///
/// Restarts are unconditional: a worker that dies immediately is
/// relaunched every monitor tick.
pub struct WorkerSupervisor {
    ctx: RunContext,
    launcher: Arc<dyn WorkerLauncher>,
    config: SupervisorConfig,
    handle: Option<WorkerHandle>,
    generation: u64,
    last_pushed_count: Option<u32>,
    status: SharedWorkerStatus,
}

impl WorkerSupervisor {
    pub fn new(ctx: RunContext, launcher: Arc<dyn WorkerLauncher>, config: SupervisorConfig) -> Self {
        Self {
            ctx,
            launcher,
            config,
            handle: None,
            generation: 0,
            last_pushed_count: None,
            status: Arc::new(RwLock::new(WorkerStatus::default())),
        }
    }

    pub fn status(&self) -> SharedWorkerStatus {
        self.status.clone()
    }

    pub fn handle(&self) -> Option<&WorkerHandle> {
        self.handle.as_ref()
    }

    /// Queue a command for the current worker
    pub fn send_command(&self, command: WorkerCommand) -> bool {
        match &self.handle {
            Some(handle) => handle.queue.send_command(command),
            None => {
                debug!("No worker running, dropped {}", command.name());
                false
            }
        }
    }

    async fn launch(&mut self) -> Result<()> {
        let (queue, rx) = CommandQueue::new(self.config.queue_capacity);
        let process = self.launcher.launch(rx).await?;
        self.generation += 1;
        let handle = WorkerHandle {
            process,
            queue,
            started_at: Instant::now(),
            generation: self.generation,
        };

        let mut status = self.status.write();
        status.running = true;
        status.pid = handle.pid();
        status.generation = handle.generation;
        drop(status);

        self.handle = Some(handle);
        Ok(())
    }

    /// Launch the first worker and activate it after the settle delay
    pub async fn start(&mut self) -> Result<()> {
        self.launch().await?;
        let pid = self.handle.as_ref().and_then(|h| h.pid());
        info!("Worker started (pid {:?}, generation {})", pid, self.generation);
        self.ctx.events().publish(SystemEvent::WorkerStarted {
            pid,
            generation: self.generation,
        });

        settle(self.config.settle).await;
        self.send_command(WorkerCommand::SetAllActive { active: true });
        Ok(())
    }

    /// One monitor tick: restart a dead worker or push a changed count
    pub async fn check(&mut self) -> Result<Option<RestartNotice>> {
        let alive = match self.handle.as_mut() {
            Some(handle) => handle.process.is_alive(),
            None => false,
        };

        if !alive {
            return self.restart().await.map(Some);
        }

        let count = self.ctx.state().local_num_people();
        if self.last_pushed_count != Some(count)
            && self.send_command(WorkerCommand::SetPeopleCount { count })
        {
            self.last_pushed_count = Some(count);
        }
        Ok(None)
    }

    /// Replace a dead worker and replay the last known state
    pub async fn restart(&mut self) -> Result<RestartNotice> {
        if let Some(old) = self.handle.take() {
            warn!(
                "Worker (pid {:?}, generation {}) died after {:?}, restarting",
                old.pid(),
                old.generation,
                old.uptime()
            );
        }
        self.status.write().running = false;

        self.launch().await?;
        let notice = RestartNotice {
            pid: self.handle.as_ref().and_then(|h| h.pid()),
            generation: self.generation,
            restarted_at: Utc::now(),
        };
        {
            let mut status = self.status.write();
            status.restarts += 1;
            status.last_restart = Some(notice.restarted_at);
        }
        info!(
            "Worker restarted (pid {:?}, generation {})",
            notice.pid, notice.generation
        );
        self.ctx
            .events()
            .publish(SystemEvent::WorkerRestarted(notice.clone()));

        settle(self.config.settle).await;
        let count = self.ctx.state().local_num_people();
        self.send_command(WorkerCommand::SetAllActive { active: true });
        self.last_pushed_count = self
            .send_command(WorkerCommand::SetPeopleCount { count })
            .then_some(count);
        Ok(notice)
    }

    /// Turn the LEDs off and stop the worker
    pub async fn shutdown(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        info!("Stopping worker (pid {:?})", handle.pid());
        handle.queue.send_command(WorkerCommand::TurnOffAll);
        handle.queue.send_command(WorkerCommand::Shutdown);
        tokio::time::sleep(self.config.shutdown_grace).await;
        handle.process.terminate(self.config.terminate_timeout).await;

        self.status.write().running = false;
        self.ctx.events().publish(SystemEvent::WorkerStopped {
            generation: handle.generation,
        });
    }

    /// Start, monitor until the run context stops, then shut down
    pub async fn run(mut self) {
        if let Err(e) = self.start().await {
            error!("Failed to start worker: {}", e);
        }

        while self.ctx.sleep(self.config.monitor_interval).await {
            if let Err(e) = self.check().await {
                error!("Failed to restart worker: {}", e);
            }
        }

        self.shutdown().await;
        info!("Worker supervisor stopped");
    }
}

async fn settle(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::state::{Field, SharedState};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeProcess {
        pid: u32,
        alive: Arc<AtomicBool>,
        terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn terminate(&mut self, _timeout: Duration) {
            self.alive.store(false, Ordering::SeqCst);
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    /// Records each instance's command receiver and liveness flag
    #[derive(Default)]
    struct FakeLauncher {
        instances: Mutex<Vec<(mpsc::Receiver<WorkerCommand>, Arc<AtomicBool>, Arc<AtomicBool>)>>,
    }

    impl FakeLauncher {
        fn drain(&self, index: usize) -> Vec<WorkerCommand> {
            let mut instances = self.instances.lock();
            let rx = &mut instances[index].0;
            let mut commands = Vec::new();
            while let Ok(cmd) = rx.try_recv() {
                commands.push(cmd);
            }
            commands
        }

        fn kill(&self, index: usize) {
            self.instances.lock()[index].1.store(false, Ordering::SeqCst);
        }

        fn terminated(&self, index: usize) -> bool {
            self.instances.lock()[index].2.load(Ordering::SeqCst)
        }

        fn count(&self) -> usize {
            self.instances.lock().len()
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(
            &self,
            commands: mpsc::Receiver<WorkerCommand>,
        ) -> Result<Box<dyn WorkerProcess>> {
            let alive = Arc::new(AtomicBool::new(true));
            let terminated = Arc::new(AtomicBool::new(false));
            let mut instances = self.instances.lock();
            let pid = 1000 + instances.len() as u32;
            instances.push((commands, alive.clone(), terminated.clone()));
            Ok(Box::new(FakeProcess {
                pid,
                alive,
                terminated,
            }))
        }
    }

    fn supervisor() -> (WorkerSupervisor, Arc<FakeLauncher>, RunContext) {
        let ctx = RunContext::new(
            Arc::new(SharedState::with_defaults()),
            Arc::new(EventBus::new()),
        );
        let launcher = Arc::new(FakeLauncher::default());
        let config = SupervisorConfig {
            queue_capacity: 8,
            monitor_interval: Duration::from_millis(10),
            settle: Duration::ZERO,
            shutdown_grace: Duration::ZERO,
            terminate_timeout: Duration::from_millis(10),
        };
        let supervisor = WorkerSupervisor::new(ctx.clone(), launcher.clone(), config);
        (supervisor, launcher, ctx)
    }

    #[tokio::test]
    async fn test_start_activates() {
        let (mut supervisor, launcher, _ctx) = supervisor();
        supervisor.start().await.unwrap();
        assert_eq!(
            launcher.drain(0),
            vec![WorkerCommand::SetAllActive { active: true }]
        );
        assert_eq!(supervisor.status().read().generation, 1);
    }

    #[tokio::test]
    async fn test_restart_replays_state() {
        let (mut supervisor, launcher, ctx) = supervisor();
        let mut events = ctx.events().subscribe();
        supervisor.start().await.unwrap();
        ctx.state().set(Field::LocalNumPeople, 5u32);

        launcher.kill(0);
        let notice = supervisor.check().await.unwrap().unwrap();

        assert_eq!(launcher.count(), 2);
        assert_eq!(notice.generation, 2);
        assert_eq!(notice.pid, Some(1001));
        assert_eq!(
            launcher.drain(1),
            vec![
                WorkerCommand::SetAllActive { active: true },
                WorkerCommand::SetPeopleCount { count: 5 },
            ]
        );

        let _started = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            SystemEvent::WorkerRestarted(n) => assert_eq!(n, notice),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(supervisor.status().read().restarts, 1);
    }

    #[tokio::test]
    async fn test_alive_worker_gets_count_changes_once() {
        let (mut supervisor, launcher, ctx) = supervisor();
        supervisor.start().await.unwrap();
        launcher.drain(0);

        ctx.state().set(Field::LocalNumPeople, 2u32);
        assert!(supervisor.check().await.unwrap().is_none());
        assert!(supervisor.check().await.unwrap().is_none());
        assert_eq!(
            launcher.drain(0),
            vec![WorkerCommand::SetPeopleCount { count: 2 }]
        );
    }

    #[tokio::test]
    async fn test_shutdown_turns_off_then_terminates() {
        let (mut supervisor, launcher, _ctx) = supervisor();
        supervisor.start().await.unwrap();
        launcher.drain(0);

        supervisor.shutdown().await;
        assert_eq!(
            launcher.drain(0),
            vec![WorkerCommand::TurnOffAll, WorkerCommand::Shutdown]
        );
        assert!(launcher.terminated(0));
        assert!(supervisor.handle().is_none());
        assert!(!supervisor.status().read().running);
    }

    #[tokio::test]
    async fn test_run_stops_with_context() {
        let (supervisor, launcher, ctx) = supervisor();
        let task = tokio::spawn(supervisor.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.stop();
        task.await.unwrap();
        assert!(launcher.terminated(0));
    }
}
