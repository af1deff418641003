pub mod admin;
pub mod error;
pub mod orchestrator;
pub mod service;
pub mod slm;
mod util;

pub use admin::AdminApi;
pub use error::{DaemonError, DaemonResult};
pub use orchestrator::{Advancement, Orchestrator, TickReport};
pub use service::LifecycleService;
pub use slm::{RetentionReport, SlmTickReport, SnapshotManager};
