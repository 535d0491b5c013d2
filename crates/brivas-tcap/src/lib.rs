//! # Brivas TCAP transaction core
//!
//! ANSI TCAP provider running over a connectionless SCCP transport:
//!
//! - **Dialogs** - transaction id allocation, registry and state machine
//! - **Dispatch** - envelope classification with partial-decode recovery
//! - **Preview** - passive monitoring that correlates both legs of a dialog
//! - **Fan-out** - TC-user listeners and a shared timer pool
//!
//! ## Example
//! ```rust,ignore
//! use brivas_tcap::{TcapStack, TcapStackConfig};
//!
//! let stack = TcapStack::new(TcapStackConfig::default(), sccp)?;
//! stack.provider().add_listener(my_listener);
//! stack.start()?;
//!
//! let dialog = stack.provider().new_dialog(local, remote)?;
//! dialog.send_query(true, None, Some(components)).await?;
//! ```

pub mod config;
pub mod errors;
pub mod sccp;
pub mod stack;
pub mod tcap;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports
pub use config::{LoggingConfig, ProviderConfig, TcapStackConfig};
pub use errors::{ParseError, Result, SccpError, TcapError};
pub use sccp::{GlobalTitle, SccpAddress, SccpListener, SccpProvider};
pub use stack::TcapStack;
pub use tcap::{Dialog, TcListener, TcapProvider};
pub use types::*;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subsystem Numbers
pub mod ssn {
    pub const HLR: u8 = 6;
    pub const VLR: u8 = 7;
    pub const MSC: u8 = 8;
    pub const GSMSCF: u8 = 147;
}
