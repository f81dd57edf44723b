pub mod annotate;
pub mod apply;
pub mod config;
pub mod distribute;
pub mod error;
pub mod image;
pub mod nodes;
pub mod pipeline;
pub mod preflight;
pub mod rollout;
pub mod runner;

pub use error::{DeployError, Result};
