use anyhow::{Context, Result};
use cadence_core::kinematics::DeltaKinematics;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Main configuration for a Cadence machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Machine-wide settings
    #[serde(default)]
    pub machine: MachineConfig,

    /// One entry per motor: X, Y, Z, then extruders
    #[serde(default)]
    pub drives: Vec<DriveConfig>,
}

/// Machine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Step timer frequency in Hz
    #[serde(default = "default_step_clock_hz")]
    pub step_clock_hz: f64,

    /// Kinematics family of the geometric axes
    #[serde(default)]
    pub kinematics: KinematicsKind,

    /// Step-generator records created at startup
    #[serde(default = "default_preallocate")]
    pub preallocate: usize,

    /// Tower geometry, required for delta kinematics
    pub delta: Option<DeltaConfig>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            step_clock_hz: default_step_clock_hz(),
            kinematics: KinematicsKind::default(),
            preallocate: default_preallocate(),
            delta: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KinematicsKind {
    #[default]
    Cartesian,
    Delta,
}

/// Delta tower geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Tower circle radius in mm
    pub radius: f64,

    /// Arm length in mm
    pub arm_length: f64,
}

/// Per-motor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub steps_per_mm: f64,

    #[serde(default)]
    pub extruder: bool,

    /// Pressure-advance gain in seconds (extruders only)
    #[serde(default)]
    pub pressure_advance: f64,
}

fn default_step_clock_hz() -> f64 {
    1_000_000.0
}

fn default_preallocate() -> usize {
    8
}

impl Config {
    /// Load configuration from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        // Try to determine format from extension
        let extension = path.extension().and_then(|s| s.to_str());

        match extension {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => {
                // Try TOML first (preferred), fall back to JSON
                Self::from_toml(&content).or_else(|_| Self::from_json(&content))
            }
        }
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config as TOML")
    }

    /// Parse configuration from JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse config as JSON")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.machine.step_clock_hz <= 0.0 {
            anyhow::bail!("machine.step_clock_hz must be positive");
        }
        if self.drives.is_empty() {
            anyhow::bail!("at least one drive must be configured");
        }

        for (index, drive) in self.drives.iter().enumerate() {
            if drive.steps_per_mm <= 0.0 {
                anyhow::bail!("drives[{index}].steps_per_mm must be positive");
            }
            if drive.pressure_advance < 0.0 {
                anyhow::bail!("drives[{index}].pressure_advance cannot be negative");
            }
        }

        if self.machine.kinematics == KinematicsKind::Delta {
            let Some(delta) = &self.machine.delta else {
                anyhow::bail!("delta kinematics requires [machine.delta] geometry");
            };
            if delta.radius <= 0.0 {
                anyhow::bail!("machine.delta.radius must be positive");
            }
            if delta.arm_length <= delta.radius {
                anyhow::bail!("machine.delta.arm_length must exceed the radius");
            }
            if self.drives.len() < 3 {
                anyhow::bail!("delta kinematics needs three tower drives");
            }
            if self.drives.iter().take(3).any(|d| d.extruder) {
                anyhow::bail!("the first three drives are towers and cannot be extruders");
            }
        }

        Ok(())
    }

    /// Build the tower geometry when the machine is a delta
    pub fn delta_kinematics(&self) -> Option<DeltaKinematics> {
        self.machine
            .delta
            .as_ref()
            .map(|d| DeltaKinematics::from_geometry(d.radius, d.arm_length))
    }
}
