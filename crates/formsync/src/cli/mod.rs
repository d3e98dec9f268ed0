//! CLI module for formsync
//!
//! `run` drives a reconciliation through the job runner. The other commands
//! only read state from the formsync home directory.

pub mod error;
pub mod output;

pub mod checkpoint;
pub mod config;
pub mod health;
pub mod run;
pub mod status;
