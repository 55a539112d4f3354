//! git-annex special remote storing content in a Backblaze B2 bucket.
//!
//! The protocol front end drives a [`B2Remote`]; everything below it talks to
//! git-annex through [`Host`] and to the bucket through
//! [`annexb2_common::ObjectStore`].

pub mod backend;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod presence;
pub mod progress;
pub mod remote;
pub mod store;

#[cfg(test)]
mod testutil;

pub use config::{CachePolicy, ConfigError, RemoteSettings};
pub use error::RemoteError;
pub use host::Host;
pub use remote::{Availability, B2Remote};
