pub mod detector;

pub use detector::{discover_apps, identity_from_bundle, resolve, ApplicationIdentity};
