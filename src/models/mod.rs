//! Core data models for peruse.
//!
//! - `config`: TOML configuration and the snapshot-recorded subset of it
//! - `error`: crate-wide error taxonomy and `Result` alias
//! - `state`: pipeline progress record, cursor and stage outputs

mod config;
mod error;
mod state;

pub use config::*;
pub use error::*;
pub use state::*;

#[cfg(test)]
pub(crate) mod test_support {
    pub(crate) use super::config::tests::minimal;
    pub(crate) use super::state::tests::{advance_items, state_with_items};
}
