//! Commands sent to the LED worker and the bounded queue carrying them

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Strand animation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationKind {
    Rainbow,
    RainbowChase,
    RainbowComet,
    RainbowSparkle,
    SparklePulse,
    Solid,
}

impl AnimationKind {
    /// Whether the animation uses the strand color
    pub fn uses_color(&self) -> bool {
        matches!(self, Self::SparklePulse | Self::Solid)
    }
}

/// Command understood by the worker
///
/// Serialized as one JSON object per line, tagged by `type`:
/// `{"type":"set_people_count","count":3}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    SetAllActive { active: bool },
    SetPeripheralActive { strand: String, active: bool },
    SetAnimation { strand: String, animation: AnimationKind },
    /// Seconds per animation step
    SetSpeed { strand: String, speed: f64 },
    SetColor { strand: String, color: [u8; 3] },
    SetPeopleCount { count: u32 },
    TurnOffAll,
    Shutdown,
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetAllActive { .. } => "set_all_active",
            Self::SetPeripheralActive { .. } => "set_peripheral_active",
            Self::SetAnimation { .. } => "set_animation",
            Self::SetSpeed { .. } => "set_speed",
            Self::SetColor { .. } => "set_color",
            Self::SetPeopleCount { .. } => "set_people_count",
            Self::TurnOffAll => "turn_off_all",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Producer side of a worker's command queue
///
/// Bounded; [`CommandQueue::send_command`] never waits and drops the
/// command when the queue is full.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<WorkerCommand>,
    dropped: Arc<AtomicU64>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkerCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue without blocking; returns whether the command was queued
    pub fn send_command(&self, command: WorkerCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Worker command queue is full, dropped {}",
                    command.name()
                );
                false
            }
            Err(TrySendError::Closed(command)) => {
                debug!("Worker queue closed, dropped {}", command.name());
                false
            }
        }
    }

    /// Commands dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&WorkerCommand::SetPeopleCount { count: 3 }).unwrap();
        assert_eq!(json, r#"{"type":"set_people_count","count":3}"#);

        let cmd: WorkerCommand = serde_json::from_str(
            r#"{"type":"set_animation","strand":"main","animation":"rainbow_chase"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            WorkerCommand::SetAnimation {
                strand: "main".to_string(),
                animation: AnimationKind::RainbowChase,
            }
        );

        let json = serde_json::to_string(&WorkerCommand::Shutdown).unwrap();
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (queue, mut rx) = CommandQueue::new(2);

        let accepted: Vec<bool> = (0..5)
            .map(|count| queue.send_command(WorkerCommand::SetPeopleCount { count }))
            .collect();
        assert_eq!(accepted, vec![true, true, false, false, false]);
        assert_eq!(queue.dropped(), 3);

        let mut received = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            received.push(cmd);
        }
        assert_eq!(
            received,
            vec![
                WorkerCommand::SetPeopleCount { count: 0 },
                WorkerCommand::SetPeopleCount { count: 1 },
            ]
        );
    }

    #[test]
    fn test_closed_queue() {
        let (queue, rx) = CommandQueue::new(1);
        drop(rx);
        assert!(queue.is_closed());
        assert!(!queue.send_command(WorkerCommand::TurnOffAll));
        assert_eq!(queue.dropped(), 0);
    }
}
