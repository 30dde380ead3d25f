//! LED worker: supervision in the main process, the LED loop in the child
//!
//! The parent talks to the worker only through a bounded command queue.
//! The supervisor restarts a dead worker and replays the state it needs.

pub mod command;
pub mod led;
pub mod process;
pub mod runtime;
pub mod supervisor;

pub use command::{AnimationKind, CommandQueue, WorkerCommand};
pub use led::{LedController, LoggingDriver, PixelDriver};
pub use process::ProcessLauncher;
pub use runtime::{run_worker, WorkerExit, WorkerRuntime};
pub use supervisor::{
    RestartNotice, SharedWorkerStatus, SupervisorConfig, WorkerHandle, WorkerLauncher,
    WorkerProcess, WorkerStatus, WorkerSupervisor,
};
