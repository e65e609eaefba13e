// Data Engine Module
// Driver abstraction, sessions, pools and SSH tunnels shared by every dialect

pub mod drivers;
pub mod error;
pub mod params;
pub mod pool;
pub mod registry;
pub mod session_manager;
pub mod ssh_tunnel;
pub mod statement;
pub mod traits;
pub mod tunnel_manager;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{EngineError, EngineResult, ErrorKind};
pub use params::Params;
pub use pool::PoolSettings;
pub use registry::DriverRegistry;
pub use session_manager::{ConnectionStrategy, SessionManager};
pub use traits::DataEngine;
pub use tunnel_manager::TunnelManager;
pub use types::*;
