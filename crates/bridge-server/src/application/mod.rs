//! Application layer: the backend seam, per-connection instance management,
//! and the timer-message scheduler.

pub mod backend;
pub mod manager;
pub mod scheduler;

pub use backend::{AppReceiver, AppSender, Backend, CreationError};
pub use manager::{ApplicationManager, CreateError};
pub use scheduler::Scheduler;
