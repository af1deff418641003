pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod io;
pub mod oracle;
pub mod paths;
pub mod policy;
pub mod repository;
pub mod slm;
pub mod state;
pub mod step;
pub mod store;
pub mod types;

pub use error::{LifecycleError, Result};
