pub mod catalog;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod route;
pub mod schedule;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{CronmeshError, Result};

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("worker");
}
