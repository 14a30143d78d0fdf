//! Shared types for the API client workspace
//!
//! Holds the pieces both the credential store and the request pipeline need
//! without depending on each other: the redacting `Secret` wrapper, the
//! config/IO error type, and the wall-clock helper used for token expiry.

mod clock;
mod error;
mod secret;

pub use clock::unix_millis;
pub use error::{Error, Result};
pub use secret::Secret;
