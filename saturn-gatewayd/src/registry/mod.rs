pub mod fingerprint;
pub mod store;

pub use store::{HealthTransition, ProbeResult, ServiceStore, UpsertOutcome};
