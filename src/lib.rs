//! # fspurge
//!
//! Thorough, reversible application removal for macOS.
//!
//! fspurge finds everything an application left across the filesystem and
//! removes it as one job:
//!
//! - **Multi-strategy discovery**: bundle identifier, name fuzzing, bundle
//!   contents and launchd labels, each with its own confidence
//! - **Protection first**: system locations and their ancestors are never
//!   touched, whatever a match scores
//! - **Confirmation gate**: nothing is removed before a plan is confirmed
//! - **Snapshots**: a verified zip archive is sealed before removal, so a
//!   failed job rolls back and a finished one can be restored
//! - **Scan cache**: repeated plans skip roots that have not changed
//! - **Analysis**: running owners, launch items, disk use and bundle
//!   dependencies, reported without touching anything

pub mod analysis;
pub mod apps;
pub mod backup;
pub mod cli;
pub mod common;
pub mod processes;
pub mod scanner;
pub mod uninstall;
