#![recursion_limit = "256"]

pub mod config;
pub mod context;
pub mod epoch;
pub mod error;
pub mod export;
pub mod loss;
pub mod lr;
pub mod metrics;
pub mod model;
pub mod msg;
pub mod progress;
pub mod pyramid;
pub mod reduce;
pub mod report;
pub mod test_runner;

mod ssim;
