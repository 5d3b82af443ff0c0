//! Case lifecycle engine for a brokerage back-office.
//!
//! Inbound messages are resolved to a broker, grouped into existing cases or
//! opened as new ones, ticketed, and then moved through the renewal state
//! machine with an append-only history and a security audit trail.

pub mod audit;
pub mod classify;
pub mod db;
pub mod engine;
pub mod error;
pub mod grouping;
pub mod identity;
pub mod lifecycle;
mod migrations;
pub mod sla;
pub mod state;
pub mod ticket;
pub mod types;
pub mod util;

pub use engine::{CaseEngine, Deadline};
pub use error::{CaseError, CaseFailure, ErrorKind};
pub use types::{Case, CaseStatus, Config, InboundMessage, PipelineAction, PipelineResult};
