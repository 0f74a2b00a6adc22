// packages/engine/src/lifecycle/mod.rs
//! Instance lifecycle
//!
//! - **State**: the `pending → running ⇄ suspended → terminated | failed` machine
//! - **Instance**: the controller-owned instance record and spawn requests
//! - **Scheduler**: cancellable heartbeat, checkpoint and sweep tasks
//! - **Controller**: spawn, suspend, resume, drain, terminate and restart

pub mod controller;
pub mod instance;
pub mod scheduler;
pub mod state;

pub use controller::{ControllerDeps, DrainReport, ExecutionReport, LifecycleController};
pub use instance::{Instance, SpawnConfig, TrustLevel, RECOGNIZED_LABELS};
pub use scheduler::TaskRegistry;
pub use state::{InstanceState, StateMachine, Transition};
