pub mod archive;
pub mod db;
pub mod dead_ends;
pub mod experiments;
pub mod findings;
pub mod io;
pub mod metrics;
pub mod sessions;

pub use archive::{import_instance, ImportSummary};
pub use db::CrucibleDb;

pub use dead_ends::{CircuitBreakerState, DeadEnd, DeadEndCategory, DeadEndManager, NewDeadEnd};
pub use experiments::{Experiment, ExperimentManager, NewExperiment};
pub use findings::FindingManager;
pub use metrics::MetricManager;
pub use sessions::{Session, SessionManager, SessionNotes};
