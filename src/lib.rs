//! Shipyard - git-push style build and deploy
//!
//! Builds pushed source with buildpacks, keeps a per-app build cache,
//! records immutable releases and runs their process formations as jobs.

pub mod apps;
pub mod artifact;
pub mod audit;
pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod exec;
pub mod formation;
pub mod gateway;
pub mod release;
pub mod scheduler;
pub mod transcript;
pub mod ui;

pub use error::{ShipyardError, ShipyardResult};
