//! The Session Manager (C5) and Janitor (C8): the process-wide cache of
//! live backend connections, with idle eviction, at-most-one concurrent
//! construction per key, and crash recovery.

pub mod config;
pub mod handle;
pub mod janitor;
pub mod manager;
pub mod session;

pub use config::SessionManagerConfig;
pub use handle::SessionHandle;
pub use janitor::Janitor;
pub use manager::SessionManager;
pub use session::{InvokeError, Session};
