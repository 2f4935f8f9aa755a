//! Supervision: instance registry, engine lifecycle, configuration routing.
//!
//! The only public API from this module is [`Supervisor`] (owned by one control task),
//! its [`SupervisorHandle`] and the [`Instance`] trait hosts implement.
//!
//! Internal modules:
//! - [`core`]: the supervisor state and every operation on it;
//! - [`handle`]: the control loop, its command queue and the handle;
//! - [`shutdown`]: cross-platform termination signal handling.

mod core;
#[cfg(test)]
mod fixtures;
mod handle;
mod instance;
mod shutdown;

pub use self::core::Supervisor;
pub use handle::SupervisorHandle;
pub use instance::Instance;
