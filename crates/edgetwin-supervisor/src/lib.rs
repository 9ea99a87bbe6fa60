//! Edge twin supervisor
//!
//! Process wiring for the twin service:
//! - Registers modules with the shared context and spawns their loops
//! - Pings every module on a fixed interval
//! - Graceful stop through the heartbeat `stop` signal

pub mod supervisor;

pub use supervisor::{Supervisor, SupervisorConfig};
