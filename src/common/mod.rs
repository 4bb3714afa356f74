pub mod config;
pub mod errors;
pub mod format;
pub mod logging;
pub mod permissions;

pub use errors::{PurgeError, PurgeResult};
