//! av-session: chat session logs with write-behind persistence.

pub mod manager;
pub mod session;

pub use manager::SessionManager;
pub use session::{AutosaveConfig, ChatSession, SessionEvent};
