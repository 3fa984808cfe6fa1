use crate::config::{Config, DriveConfig, KinematicsKind};
use anyhow::{Context, Result, bail};
use cadence_core::dda::{Dda, MoveParams, PrepParams};
use cadence_core::drive_movement::{DmState, DriveMovement};
use cadence_core::pool::DmPool;
use cadence_core::shaper::ExtruderShaper;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct SimulateArgs {
    /// Path to the configuration file (TOML or JSON).
    pub config: PathBuf,

    /// Per-drive displacements in mm: X,Y,Z, then extruders.
    #[arg(long = "move", value_delimiter = ',', allow_negative_numbers = true)]
    pub moves: Vec<f64>,

    /// Requested speed along the path, mm/s.
    #[arg(long, default_value_t = 50.0)]
    pub speed: f64,

    /// Acceleration, mm/s^2.
    #[arg(long, default_value_t = 1000.0)]
    pub accel: f64,

    /// Deceleration, mm/s^2.
    #[arg(long, default_value_t = 1000.0)]
    pub decel: f64,

    /// Speed carried into a following move, mm/s.
    #[arg(long, default_value_t = 0.0)]
    pub end_speed: f64,

    /// Effector X position at the start of the move (delta machines).
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub start_x: f64,

    /// Effector Y position at the start of the move (delta machines).
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub start_y: f64,

    /// Apply pressure advance on extruder drives.
    #[arg(long)]
    pub pressure_advance: bool,

    /// Print every scheduled step instead of a per-drive summary.
    #[arg(long)]
    pub verbose: bool,
}

struct DriveReport {
    drive: usize,
    steps: u64,
    reverse_start: Option<u32>,
    direction_changed: bool,
    first: Option<u32>,
    last: Option<u32>,
    state: DmState,
}

impl SimulateArgs {
    pub fn run(&self) -> Result<()> {
        tracing_subscriber::fmt::init();

        let config = Config::from_file(&self.config)?;
        config.validate()?;

        if self.moves.is_empty() {
            bail!("--move requires at least one displacement");
        }
        if self.moves.len() > config.drives.len() {
            bail!(
                "move names {} drives but the machine has {}",
                self.moves.len(),
                config.drives.len()
            );
        }

        let clock = config.machine.step_clock_hz;
        let mut moves = self.moves.clone();
        moves.resize(config.drives.len(), 0.0);

        let dda = Dda::plan(
            &MoveParams {
                moves,
                speed: self.speed,
                acceleration: self.accel,
                deceleration: self.decel,
                end_speed: self.end_speed,
                use_pressure_advance: self.pressure_advance,
            },
            clock,
        )
        .context("failed to plan move")?;

        tracing::info!(
            "planned {:.3} mm move taking {} clocks ({:.1} ms)",
            dda.total_distance,
            dda.clocks_needed,
            dda.clocks_needed as f64 / clock * 1000.0
        );

        let towers = config.delta_kinematics();
        let is_delta = config.machine.kinematics == KinematicsKind::Delta;
        let params = PrepParams::new(&dda, self.start_x, self.start_y, towers.as_ref());

        let mut pool = DmPool::new();
        pool.initial_allocate(config.machine.preallocate);

        let mut reports = Vec::new();
        for (index, drive) in config.drives.iter().enumerate() {
            if dda.direction_vector[index] == 0.0 {
                continue;
            }
            let handle = pool.allocate(index as u8, DmState::Idle);
            let report =
                self.run_drive(pool.get_mut(handle), &dda, &params, drive, is_delta, clock)?;
            reports.push(report);
            pool.release(handle);
        }

        println!("drive     steps  reverse@      first       last  state");
        for r in &reports {
            println!(
                "{:5} {:9}  {:>8}  {:>9}  {:>9}  {:?}{}",
                r.drive,
                r.steps,
                r.reverse_start.map_or("-".to_string(), |s| s.to_string()),
                r.first.map_or("-".to_string(), |t| t.to_string()),
                r.last.map_or("-".to_string(), |t| t.to_string()),
                r.state,
                if r.direction_changed { " (reversed)" } else { "" },
            );
        }
        Ok(())
    }

    fn run_drive(
        &self,
        dm: &mut DriveMovement,
        dda: &Dda,
        params: &PrepParams,
        drive: &DriveConfig,
        is_delta: bool,
        clock: f64,
    ) -> Result<DriveReport> {
        let index = dm.drive() as usize;
        let mut shaper = ExtruderShaper::new(drive.pressure_advance * clock);
        let mut alive = if drive.extruder {
            dm.prepare_extruder(dda, params, drive.steps_per_mm, &mut shaper)
        } else if is_delta && index < 3 {
            dm.prepare_delta_axis(dda, params, drive.steps_per_mm)
        } else {
            dm.prepare_cartesian_axis(dda, params, drive.steps_per_mm)
        };

        let mut first = None;
        let mut last = None;
        let mut steps = 0u64;
        while alive {
            if self.verbose {
                println!(
                    "  drive {} step {:6} at {:9} dir={}",
                    index,
                    dm.next_step(),
                    dm.next_step_time(),
                    if dm.direction() { 'F' } else { 'B' },
                );
            }
            first.get_or_insert(dm.next_step_time());
            last = Some(dm.next_step_time());
            steps += 1;
            alive = dm.calc_next_step_time(dda);
        }

        if dm.state() == DmState::StepError {
            tracing::error!("drive {} step error: {}", index, dm);
            bail!("drive {} entered a step error", index);
        }
        if drive.extruder && shaper.extrusion_pending().abs() > 0.0 {
            tracing::debug!(
                "drive {} carries {:.5} mm of pending extrusion",
                index,
                shaper.extrusion_pending()
            );
        }

        let reverse_start = (dm.reverse_start_step() <= dm.total_steps())
            .then(|| dm.reverse_start_step());
        Ok(DriveReport {
            drive: index,
            steps,
            reverse_start,
            direction_changed: dm.direction_changed(),
            first,
            last,
            state: dm.state(),
        })
    }
}
