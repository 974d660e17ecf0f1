//! Connection negotiation
//!
//! Turns a user-supplied target into one live session:
//!
//! - [`target`]       -- Target normalization and candidate planning
//! - [`race`]         -- Concurrent candidate race with full teardown
//! - [`orchestrator`] -- Auth check, race, relay fallback, session ownership
//! - [`recent`]       -- Recent-target list

pub mod orchestrator;
pub mod race;
pub mod recent;
pub mod target;

pub use orchestrator::{
    ConnectOutcome, ConnectRequest, NegotiationSettings, NegotiationState, Orchestrator,
    SessionInfo,
};
pub use race::{RaceCoordinator, Session};
pub use recent::{RecentChange, RecentTargets};
pub use target::{CandidatePlan, ConnectionTarget, PathSegments};
