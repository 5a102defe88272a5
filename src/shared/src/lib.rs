//! Shared types for the messaging CRM automation platform
//!
//! Everything that crosses a service boundary lives here: domain events and
//! the event catalog, automation rule definitions and execution records,
//! webhook subscriptions and delivery logs, plus the request DTOs the
//! administration console sends and their validation.

pub mod types;

pub use types::*;
