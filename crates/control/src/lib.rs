//! Control-plane server for the Trellis edge fabric.
//!
//! The authoritative registry for a fleet of hubs: it mints and
//! verifies capability tokens, tracks hubs and the services they
//! export, stores label links, pushes routing deltas to every
//! connected hub in near-real-time, and aggregates the per-flow
//! telemetry hubs push back.

pub mod auth;
pub mod error;
pub mod flowtop;
pub mod metrics;
pub mod ops;
pub mod service;
pub mod session;
pub mod telemetry;

pub use error::{ControlError, ControlResult};
pub use flowtop::{DEFAULT_FLOW_TOP_SIZE, FlowEntry, FlowTop};
pub use service::ControlService;
pub use session::SessionRegistry;
pub use telemetry::Telemetry;
