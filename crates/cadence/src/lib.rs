//! Command-line front end for the Cadence step-timing engine.

pub mod cli;
pub mod config;
