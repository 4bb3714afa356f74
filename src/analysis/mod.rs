//! Read-only reports on an installed application: what it runs, what it
//! occupies, and what its bundle ships and links against.

pub mod dependencies;
pub mod impact;

use serde::Serialize;

use crate::apps::ApplicationIdentity;
use crate::scanner::walker::ScanWarning;

pub use dependencies::{bundle_dependencies, DependencyReport};
pub use impact::{measure, ImpactReport, ProcessImpact};

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub identity: ApplicationIdentity,
    pub impact: ImpactReport,
    pub dependencies: DependencyReport,
    pub scan_warnings: Vec<ScanWarning>,
}
