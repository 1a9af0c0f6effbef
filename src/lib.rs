//! Umbrella crate for the demos: re-exports the nuwa library crates.

pub use nuwa_core as core;
pub use nuwa_session as session;
pub use nuwa_storage as storage;
