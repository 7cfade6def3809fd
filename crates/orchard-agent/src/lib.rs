//! # orchard-agent
//!
//! The Orchard device agent daemon. The binary wires configuration,
//! logging, and signal handling around [`agent::Agent`], which runs the
//! five concurrent loops (policy, state, event flush, login, and
//! attestation) over the components in `orchard-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;

pub use agent::{Agent, AgentBuilder, AgentError};
