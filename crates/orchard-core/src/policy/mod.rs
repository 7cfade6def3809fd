//! Policy verification, caching, and enforcement.

mod pipeline;
mod verifier;

pub use pipeline::{
    AppsAdapter, BrowserAdapter, NetworkAdapter, PolicyError, PolicyManager, SecurityAdapter,
    UpdatesAdapter,
};
pub use verifier::{Verifier, VerifierError, canonical_policy_bytes};
