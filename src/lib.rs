//! rund - staged service manager
//!
//! A service manager designed to run as a direct child of PID 1. It loads
//! YAML service descriptors, starts them in ascending stage order, supervises
//! each child with a dedicated reap observer, and answers a JSON control
//! protocol on a Unix socket inside its runtime directory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                      rund                        │
//! ├──────────────────────────────────────────────────┤
//! │  Loader / Registry │  Supervisor  │ Control sock │
//! ├──────────────────────────────────────────────────┤
//! │      Enabled stages   │   Rotating log sink      │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod control;
pub mod logs;
pub mod manager;
pub mod protocol;
pub mod services;
pub mod signals;

pub use manager::{Manager, SharedManager};
pub use services::{ServiceDefinition, ServiceKind, ServiceState};
