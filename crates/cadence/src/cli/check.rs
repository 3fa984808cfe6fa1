use crate::config::Config;
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the configuration file (TOML or JSON).
    pub config: PathBuf,
}

impl CheckArgs {
    pub fn run(&self) -> Result<()> {
        tracing_subscriber::fmt::init();

        let config = Config::from_file(&self.config)?;
        config.validate()?;

        tracing::info!("configuration {} is valid", self.config.display());
        println!(
            "{} drives, {:?} kinematics, {} Hz step clock",
            config.drives.len(),
            config.machine.kinematics,
            config.machine.step_clock_hz
        );
        Ok(())
    }
}
