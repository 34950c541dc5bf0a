//! Shared foundation for the FunnelFlow automation platform: errors,
//! configuration, the event bus, the clock abstraction, subscriber
//! profiles, and the collaborator contracts the engine consumes.

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod subscriber;
