//! XenServer VM backup library
//!
//! Full and differential backups of whole VMs to a local storage root, and
//! restores of those backups into new VMs, driven through the pool's
//! management API and its raw VDI data-plane.

pub mod config;
pub mod executor;
pub mod inventory;
pub mod meta;
pub mod registry;
pub mod resolver;
pub mod snapshot;
pub mod transfer;
pub mod utils;
pub mod xapi;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
