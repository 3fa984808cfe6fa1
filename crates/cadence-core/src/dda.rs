//! Planned-move block handed to the per-drive step generators.
//!
//! A [`Dda`] describes one move: the unit direction vector across all
//! drives, the trapezoidal velocity profile in the mm/step-clock unit
//! system, and the segment lists the generators walk. Planning here is
//! deliberately local to a single move; look-ahead between moves happens
//! upstream.

use thiserror::Error;

use crate::kinematics::DeltaKinematics;
use crate::move_segment::MoveSegment;

/// Geometric axes ahead of the extruder drives in the direction vector.
pub const AXES: usize = 3;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("move has no distance")]
    ZeroLengthMove,
    #[error("speed must be finite and positive, got {0}")]
    InvalidSpeed(f64),
    #[error("acceleration must be finite and positive, got {0}")]
    InvalidAcceleration(f64),
}

/// Requested move, in user units (mm, mm/s, mm/s^2).
#[derive(Clone, Debug)]
pub struct MoveParams {
    /// Per-drive displacement in mm: X, Y, Z, then extruders.
    pub moves: Vec<f64>,
    pub speed: f64,
    pub acceleration: f64,
    pub deceleration: f64,
    /// Speed carried into the next move; zero for a move that stops.
    pub end_speed: f64,
    pub use_pressure_advance: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DdaFlags {
    pub use_pressure_advance: bool,
}

/// One planned move in the clock domain.
#[derive(Clone, Debug)]
pub struct Dda {
    /// Unit path tangent over all drives (extruder components are mm of
    /// extrusion per mm of path).
    pub direction_vector: Vec<f64>,
    /// Path length in mm (extrusion length for extruder-only moves).
    pub total_distance: f64,
    /// mm per clock^2
    pub acceleration: f64,
    pub deceleration: f64,
    /// mm per clock
    pub top_speed: f64,
    pub accel_clocks: f64,
    pub decel_clocks: f64,
    pub decel_start_distance: f64,
    /// Total move duration in clocks.
    pub clocks_needed: u32,
    pub flags: DdaFlags,
    shaped_segments: Vec<MoveSegment>,
    unshaped_segments: Vec<MoveSegment>,
}

impl Dda {
    /// Plan a trapezoidal profile for the requested move. Falls back to a
    /// triangular profile when the cruise phase vanishes.
    pub fn plan(params: &MoveParams, clock_hz: f64) -> Result<Self, PlanError> {
        if !(params.speed.is_finite() && params.speed > 0.0) {
            return Err(PlanError::InvalidSpeed(params.speed));
        }
        if !(params.acceleration.is_finite() && params.acceleration > 0.0) {
            return Err(PlanError::InvalidAcceleration(params.acceleration));
        }
        if !(params.deceleration.is_finite() && params.deceleration > 0.0) {
            return Err(PlanError::InvalidAcceleration(params.deceleration));
        }
        if !(params.end_speed.is_finite() && params.end_speed >= 0.0) {
            return Err(PlanError::InvalidSpeed(params.end_speed));
        }

        let mut moves = params.moves.clone();
        if moves.len() < AXES {
            moves.resize(AXES, 0.0);
        }

        let axis_distance = moves[..AXES]
            .iter()
            .map(|d| d * d)
            .sum::<f64>()
            .sqrt();
        let total_distance = if axis_distance > 0.0 {
            axis_distance
        } else {
            // Extruder-only move: the extrusion vector sets the distance.
            moves[AXES..].iter().map(|d| d * d).sum::<f64>().sqrt()
        };
        if total_distance <= 0.0 {
            return Err(PlanError::ZeroLengthMove);
        }

        let direction_vector: Vec<f64> = moves.iter().map(|d| d / total_distance).collect();

        // Convert to the clock domain.
        let requested = params.speed / clock_hz;
        let accel = params.acceleration / (clock_hz * clock_hz);
        let decel = params.deceleration / (clock_hz * clock_hz);

        let mut top_speed = requested;
        let mut end_speed = (params.end_speed / clock_hz).min(requested);
        let mut accel_distance = (top_speed * top_speed) / (2.0 * accel);
        let mut decel_distance =
            (top_speed * top_speed - end_speed * end_speed) / (2.0 * decel);
        if accel_distance + decel_distance > total_distance {
            // No room to reach the requested speed.
            top_speed = ((2.0 * accel * decel * total_distance
                + accel * end_speed * end_speed)
                / (accel + decel))
                .sqrt();
            if top_speed < end_speed {
                // Too short even to reach the exit speed; accelerate the
                // whole way and leave at whatever speed results.
                top_speed = (2.0 * accel * total_distance).sqrt();
                end_speed = top_speed;
            }
            accel_distance = (top_speed * top_speed) / (2.0 * accel);
            decel_distance = (top_speed * top_speed - end_speed * end_speed) / (2.0 * decel);
        }

        let accel_clocks = top_speed / accel;
        let decel_clocks = (top_speed - end_speed) / decel;
        let steady_distance = (total_distance - accel_distance - decel_distance).max(0.0);
        let steady_clocks = steady_distance / top_speed;
        let decel_start_distance = total_distance - decel_distance;
        let clocks_needed = (accel_clocks + steady_clocks + decel_clocks) as u32;

        let mut unshaped_segments = Vec::with_capacity(3);
        if accel_distance > 0.0 {
            unshaped_segments.push(MoveSegment::ramp(accel_distance, accel_clocks, 0.0, accel));
        }
        if steady_distance > 1e-9 {
            // A triangular profile can leave femtometres of residual cruise.
            unshaped_segments.push(MoveSegment::linear(steady_distance, steady_clocks));
        }
        if decel_distance > 0.0 {
            unshaped_segments.push(MoveSegment::ramp(
                decel_distance,
                decel_clocks,
                top_speed,
                -decel,
            ));
        }

        Ok(Self {
            direction_vector,
            total_distance,
            acceleration: accel,
            deceleration: decel,
            top_speed,
            accel_clocks,
            decel_clocks,
            decel_start_distance,
            clocks_needed,
            flags: DdaFlags {
                use_pressure_advance: params.use_pressure_advance,
            },
            shaped_segments: Vec::new(),
            unshaped_segments,
        })
    }

    /// Segment list for geometric axes: the shaped list when input shaping
    /// has produced one, otherwise the raw profile.
    pub fn axis_segments(&self) -> &[MoveSegment] {
        if self.shaped_segments.is_empty() {
            &self.unshaped_segments
        } else {
            &self.shaped_segments
        }
    }

    /// Extruders always follow the unshaped profile.
    pub fn extruder_segments(&self) -> &[MoveSegment] {
        &self.unshaped_segments
    }
}

/// Per-move constants shared by the preparation routines.
#[derive(Clone, Copy)]
pub struct PrepParams<'a> {
    /// Effector position at the start of the move (delta preparation only).
    pub initial_x: f64,
    pub initial_y: f64,
    /// Squared XY magnitude of the direction vector.
    pub a2_plus_b2: f64,
    pub accel_clocks: f64,
    pub decel_clocks: f64,
    pub decel_start_distance: f64,
    pub delta: Option<&'a DeltaKinematics>,
}

impl<'a> PrepParams<'a> {
    pub fn new(
        dda: &Dda,
        initial_x: f64,
        initial_y: f64,
        delta: Option<&'a DeltaKinematics>,
    ) -> Self {
        Self {
            initial_x,
            initial_y,
            a2_plus_b2: dda.direction_vector[0] * dda.direction_vector[0]
                + dda.direction_vector[1] * dda.direction_vector[1],
            accel_clocks: dda.accel_clocks,
            decel_clocks: dda.decel_clocks,
            decel_start_distance: dda.decel_start_distance,
            delta,
        }
    }
}
