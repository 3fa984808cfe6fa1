//! Per-drive step-time generation.
//!
//! A [`DriveMovement`] walks the segment list of one planned move and
//! answers, on demand, when the next step pulse for its motor is due. The
//! closed-form segment coefficients make each answer a handful of float
//! operations, cheap enough for a timer-interrupt context. Three flavours
//! share the machinery: Cartesian axes, delta towers (which track carriage
//! height and may reverse at the tower apex), and extruders (which fold in
//! pressure advance and may reverse during deceleration).

use std::fmt;

use crate::dda::{Dda, PrepParams};
use crate::move_segment::{self, MoveSegment};
use crate::shaper::ExtruderShaper;

/// Smallest step interval, in clocks, for which a fresh calculation per
/// step is still worthwhile. Below it the generator switches to double,
/// quad or octal stepping.
pub const MIN_CALC_INTERVAL: u32 = 250;

/// Kinematic phase of one drive within a move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmState {
    Idle,
    StepError,
    CartLinear,
    CartAccel,
    CartDecelNoReverse,
    CartDecelForwardsReversing,
    CartDecelReverse,
    DeltaForwardsNoReverse,
    DeltaForwardsReversing,
    DeltaReverse,
}

#[derive(Clone, Copy, Debug, Default)]
struct CartParams {
    effective_steps_per_mm: f64,
    effective_mm_per_step: f64,
    /// Pressure-advance gain in clocks; zero for plain axes.
    pressure_advance_k: f64,
    extra_extrusion_distance: f64,
}

#[derive(Clone, Copy, Debug)]
struct DeltaParams {
    /// Carriage height above the effector at the start of the move, mm.
    h0_minus_z0: f64,
    two_a: f64,
    two_b: f64,
    /// Carriage height above the Z datum in step units; stepped up or down
    /// by the generator as pulses are produced.
    hmz0s: f64,
    minus_aa_plus_bb_times_s: f64,
    d2_minus_a2_minus_b2_times_s2: f64,
    /// Distance along the path at which the carriage tops out. Negative
    /// when the apex is already behind, beyond the move when ahead of it.
    reverse_start_distance: f64,
    steps_per_mm: f64,
}

#[derive(Clone, Copy, Debug)]
enum AxisParams {
    Cart(CartParams),
    Delta(DeltaParams),
}

/// Step generator state for one motor over one move.
#[derive(Debug)]
pub struct DriveMovement {
    drive: u8,
    state: DmState,
    direction: bool,
    direction_changed: bool,
    is_extruder: bool,
    total_steps: u32,
    /// 1-based index of the step about to fire; 0 before the first.
    next_step: u32,
    /// Step index at which travel reverses; total_steps + 1 when it never
    /// does.
    reverse_start_step: u32,
    /// Exclusive step index at which the current segment's coefficients
    /// stop being valid.
    phase_step_limit: u32,
    /// Clocks from the start of the move to the next step.
    next_step_time: u32,
    step_interval: u32,
    steps_till_recalc: u32,
    p_a: f64,
    p_b: f64,
    p_c: f64,
    current_segment: Option<usize>,
    distance_so_far: f64,
    time_so_far: f64,
    params: AxisParams,
    pub(crate) next_free: Option<u32>,
}

impl DriveMovement {
    pub fn new(drive: u8) -> Self {
        Self {
            drive,
            state: DmState::Idle,
            direction: false,
            direction_changed: false,
            is_extruder: false,
            total_steps: 0,
            next_step: 0,
            reverse_start_step: 0,
            phase_step_limit: 0,
            next_step_time: 0,
            step_interval: 0,
            steps_till_recalc: 0,
            p_a: 0.0,
            p_b: 0.0,
            p_c: 0.0,
            current_segment: None,
            distance_so_far: 0.0,
            time_so_far: 0.0,
            params: AxisParams::Cart(CartParams::default()),
            next_free: None,
        }
    }

    pub(crate) fn assign(&mut self, drive: u8, state: DmState) {
        self.drive = drive;
        self.state = state;
    }

    pub fn drive(&self) -> u8 {
        self.drive
    }

    pub fn state(&self) -> DmState {
        self.state
    }

    pub fn direction(&self) -> bool {
        self.direction
    }

    pub fn direction_changed(&self) -> bool {
        self.direction_changed
    }

    /// Acknowledge a direction flip once the hardware direction pin has
    /// been committed.
    pub fn clear_direction_changed(&mut self) {
        self.direction_changed = false;
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    pub fn next_step(&self) -> u32 {
        self.next_step
    }

    pub fn next_step_time(&self) -> u32 {
        self.next_step_time
    }

    pub fn step_interval(&self) -> u32 {
        self.step_interval
    }

    pub fn reverse_start_step(&self) -> u32 {
        self.reverse_start_step
    }

    pub fn is_delta(&self) -> bool {
        matches!(self.params, AxisParams::Delta(_))
    }

    pub fn is_extruder(&self) -> bool {
        self.is_extruder
    }

    fn segments<'a>(&self, dda: &'a Dda) -> &'a [MoveSegment] {
        if self.is_extruder {
            dda.extruder_segments()
        } else {
            dda.axis_segments()
        }
    }

    fn advance_segment(&mut self, segment_count: usize) {
        self.current_segment = match self.current_segment {
            Some(index) if index + 1 < segment_count => Some(index + 1),
            _ => None,
        };
    }

    /// Take on the next segment for a Cartesian axis, skipping segments
    /// that contribute no steps. Returns false when the list is exhausted.
    fn new_cartesian_segment(&mut self, dda: &Dda) -> bool {
        let AxisParams::Cart(cart) = self.params else {
            return false;
        };
        let segments = self.segments(dda);
        loop {
            let segment = match self.current_segment {
                Some(index) => &segments[index],
                None => return false,
            };

            self.p_c = segment.calc_c(cart.effective_mm_per_step);
            if segment.is_linear() {
                self.p_b = segment.calc_linear_b(self.distance_so_far, self.time_so_far);
                self.state = DmState::CartLinear;
            } else {
                self.p_a = segment.calc_nonlinear_a(self.distance_so_far);
                self.p_b = segment.calc_nonlinear_b(self.time_so_far);
                self.state = if segment.is_accelerating() {
                    DmState::CartAccel
                } else {
                    DmState::CartDecelNoReverse
                };
            }

            self.distance_so_far += segment.length();
            self.time_so_far += segment.duration();

            self.phase_step_limit =
                (self.distance_so_far * cart.effective_steps_per_mm) as u32 + 1;
            if self.next_step < self.phase_step_limit {
                return true;
            }

            self.advance_segment(segments.len());
        }
    }

    /// Take on the next segment for a delta tower. The step limit comes
    /// from the carriage geometry and may be expressed relative to the
    /// reversal pivot.
    fn new_delta_segment(&mut self, dda: &Dda) -> bool {
        let segments = self.segments(dda);
        loop {
            let index = match self.current_segment {
                Some(index) => index,
                None => return false,
            };
            let segment = &segments[index];
            let AxisParams::Delta(delta) = self.params else {
                return false;
            };
            let steps_per_mm = delta.steps_per_mm;

            self.p_c = segment.c() / steps_per_mm;
            if segment.is_linear() {
                self.p_b = segment.calc_linear_b(self.distance_so_far, self.time_so_far);
            } else {
                self.p_a = segment.calc_nonlinear_a(self.distance_so_far);
                self.p_b = segment.calc_nonlinear_b(self.time_so_far);
            }

            let start_distance = self.distance_so_far;
            self.distance_so_far += segment.length();
            self.time_so_far += segment.duration();

            // Signed net carriage travel, in steps, from the start of the
            // move to the end of this segment.
            let s_dx = self.distance_so_far * dda.direction_vector[0];
            let s_dy = self.distance_so_far * dda.direction_vector[1];
            let net_steps_at_end = ((delta.d2_minus_a2_minus_b2_times_s2
                - steps_per_mm
                    * steps_per_mm
                    * (s_dx * (s_dx + delta.two_a) + s_dy * (s_dy + delta.two_b)))
                .max(0.0)
                .sqrt()
                + (self.distance_so_far * dda.direction_vector[2] - delta.h0_minus_z0)
                    * steps_per_mm) as i32;

            let last = index + 1 == segments.len();
            if delta.reverse_start_distance <= start_distance {
                // Purely downwards segment, upper quadratic root. There may
                // have been upwards motion earlier in the move.
                if self.direction {
                    self.direction = false;
                    self.direction_changed = true;
                }
                self.state = DmState::DeltaReverse;
                self.phase_step_limit = if last {
                    self.total_steps + 1
                } else if self.reverse_start_step <= self.total_steps {
                    (2 * self.reverse_start_step as i64 - net_steps_at_end as i64) as u32
                } else {
                    (1 - net_steps_at_end as i64) as u32
                };
            } else if self.distance_so_far <= delta.reverse_start_distance {
                // Purely upwards segment, lower quadratic root.
                self.state = DmState::DeltaForwardsNoReverse;
                self.phase_step_limit = if last {
                    self.total_steps + 1
                } else {
                    (net_steps_at_end + 1) as u32
                };
            } else {
                // The apex lies inside this segment; lower root until the
                // generator crosses the pivot.
                self.phase_step_limit = if last {
                    self.total_steps + 1
                } else {
                    (2 * self.reverse_start_step as i64 - net_steps_at_end as i64) as u32
                };
                self.state = DmState::DeltaForwardsReversing;
            }

            if self.phase_step_limit > self.next_step {
                return true;
            }

            self.advance_segment(segments.len());
        }
    }

    /// Take on the next segment for an extruder. Pressure advance extends
    /// the accelerating phase; the single decelerating segment is assumed
    /// to carry a possible reversal, decided per step.
    fn new_extruder_segment(&mut self, dda: &Dda) -> bool {
        let AxisParams::Cart(cart) = self.params else {
            return false;
        };
        let segments = self.segments(dda);
        loop {
            let segment = match self.current_segment {
                Some(index) => &segments[index],
                None => return false,
            };

            let start_distance = self.distance_so_far;
            let start_time = self.time_so_far;

            self.distance_so_far += segment.length();
            self.time_so_far += segment.duration();

            self.p_c = segment.calc_c(cart.effective_mm_per_step);
            if segment.is_linear() {
                self.p_b = segment.calc_linear_b(start_distance, start_time);
                self.phase_step_limit =
                    (self.distance_so_far * cart.effective_steps_per_mm) as u32 + 1;
                self.state = DmState::CartLinear;
            } else {
                self.p_a =
                    segment.calc_nonlinear_a_with_pa(start_distance, cart.pressure_advance_k);
                self.p_b = segment.calc_nonlinear_b_with_pa(start_time, cart.pressure_advance_k);
                if segment.is_accelerating() {
                    // The single accelerating segment also covers the extra
                    // extrusion that pressure advance demands.
                    self.distance_so_far += cart.extra_extrusion_distance;
                    self.phase_step_limit =
                        (self.distance_so_far * cart.effective_steps_per_mm) as u32 + 1;
                    self.state = DmState::CartAccel;
                } else {
                    // Only one decelerating segment exists and it ends the
                    // move; it may contain a reversal.
                    self.phase_step_limit = self.total_steps + 1;
                    self.state = DmState::CartDecelForwardsReversing;
                }
            }

            if self.next_step < self.phase_step_limit {
                return true;
            }

            self.advance_segment(segments.len());
        }
    }

    /// Set up for a Cartesian axis move. Returns true if this axis has any
    /// steps to do, with the first step time already computed.
    pub fn prepare_cartesian_axis(
        &mut self,
        dda: &Dda,
        _params: &PrepParams,
        steps_per_mm: f64,
    ) -> bool {
        let component = dda.direction_vector[self.drive as usize];
        let effective_steps_per_mm = steps_per_mm * component.abs();
        self.distance_so_far = 0.0;
        self.time_so_far = 0.0;
        self.params = AxisParams::Cart(CartParams {
            effective_steps_per_mm,
            effective_mm_per_step: 1.0 / effective_steps_per_mm,
            pressure_advance_k: 0.0,
            extra_extrusion_distance: 0.0,
        });
        self.is_extruder = false;
        self.total_steps = (dda.total_distance * effective_steps_per_mm) as u32;
        self.direction = component >= 0.0;
        self.direction_changed = false;
        self.current_segment = if dda.axis_segments().is_empty() {
            None
        } else {
            Some(0)
        };
        self.next_step = 0; // must precede the segment setup

        if !self.new_cartesian_segment(dda) {
            return false;
        }

        self.next_step_time = 0;
        self.step_interval = 999_999; // large, so the first calculation is for a single step
        self.steps_till_recalc = 0;
        self.reverse_start_step = self.total_steps + 1; // no reverse phase
        self.calc_next_step_time(dda)
    }

    /// Set up for a delta tower move. Derives the net carriage travel, the
    /// apex position and, when the apex falls inside the move, the rewritten
    /// step total for the up-then-down walk.
    pub fn prepare_delta_axis(
        &mut self,
        dda: &Dda,
        params: &PrepParams,
        steps_per_mm: f64,
    ) -> bool {
        let towers = params.delta.expect("delta kinematics required");
        let drive = self.drive as usize;
        let a = params.initial_x - towers.tower_x(drive);
        let b = params.initial_y - towers.tower_y(drive);
        let a_a_plus_b_b = a * dda.direction_vector[0] + b * dda.direction_vector[1];
        let d2_minus_a2_minus_b2 = towers.diagonal_squared(drive) - a * a - b * b;
        let h0_minus_z0 = d2_minus_a2_minus_b2.sqrt();

        // Net carriage travel across the whole move fixes the nominal step
        // count and the starting direction.
        let s_dx = dda.total_distance * dda.direction_vector[0];
        let s_dy = dda.total_distance * dda.direction_vector[1];
        let net_steps = ((d2_minus_a2_minus_b2
            - (s_dx * (s_dx + 2.0 * a) + s_dy * (s_dy + 2.0 * b)))
            .max(0.0)
            .sqrt()
            - h0_minus_z0
            + dda.total_distance * dda.direction_vector[2])
            * steps_per_mm;
        self.total_steps = net_steps.abs() as u32;
        self.direction = net_steps >= 0.0;
        self.direction_changed = false;

        let mut delta = DeltaParams {
            h0_minus_z0,
            two_a: 2.0 * a,
            two_b: 2.0 * b,
            hmz0s: h0_minus_z0 * steps_per_mm,
            minus_aa_plus_bb_times_s: -(a_a_plus_b_b * steps_per_mm),
            d2_minus_a2_minus_b2_times_s2: d2_minus_a2_minus_b2 * (steps_per_mm * steps_per_mm),
            reverse_start_distance: 0.0,
            steps_per_mm,
        };

        if params.a2_plus_b2 <= 0.0 {
            // Pure Z movement; the quadratic below would divide by zero.
            self.direction = dda.direction_vector[2] >= 0.0;
            delta.reverse_start_distance = if self.direction {
                dda.total_distance + 1.0
            } else {
                -1.0
            };
            self.reverse_start_step = self.total_steps + 1;
        } else {
            // Of the two quadratic roots, one has the carriage below the
            // bed; the other is the apex distance we want.
            let drev = ((dda.direction_vector[2]
                * (params.a2_plus_b2 * towers.diagonal_squared(drive)
                    - {
                        let t = a * dda.direction_vector[1] - b * dda.direction_vector[0];
                        t * t
                    })
                .sqrt())
                - a_a_plus_b_b)
                / params.a2_plus_b2;
            delta.reverse_start_distance = drev;
            if drev > 0.0 && drev < dda.total_distance {
                // Carriage height at the apex tells us how far up we go.
                let hrev = dda.direction_vector[2] * drev
                    + (d2_minus_a2_minus_b2
                        - 2.0 * drev * a_a_plus_b_b
                        - params.a2_plus_b2 * drev * drev)
                        .sqrt();
                let num_steps_up = ((hrev - h0_minus_z0) * steps_per_mm) as i32;

                if num_steps_up < 1 {
                    // Almost at peak height already; treat the apex as
                    // passed.
                    delta.reverse_start_distance = -1.0;
                    self.reverse_start_step = self.total_steps + 1;
                    self.direction = false;
                } else {
                    self.reverse_start_step = num_steps_up as u32 + 1;
                    if self.direction {
                        // Net up: up first, then down by a lesser amount.
                        self.total_steps = 2 * num_steps_up as u32 - self.total_steps;
                    } else {
                        // Net down: up first, then down by a greater amount.
                        self.direction = true;
                        self.total_steps = 2 * num_steps_up as u32 + self.total_steps;
                    }
                }
            } else {
                self.reverse_start_step = self.total_steps + 1;
                self.direction = drev >= 0.0;
            }
        }

        self.distance_so_far = 0.0;
        self.time_so_far = 0.0;
        self.is_extruder = false;
        self.params = AxisParams::Delta(delta);
        self.current_segment = if dda.axis_segments().is_empty() {
            None
        } else {
            Some(0)
        };

        self.next_step = 0; // must precede the segment setup
        if !self.new_delta_segment(dda) {
            return false;
        }

        self.next_step_time = 0;
        self.step_interval = 999_999; // large, so the first calculation is for a single step
        self.steps_till_recalc = 0;
        self.calc_next_step_time(dda)
    }

    /// Set up for an extruder move. Accounts for carried-over fractional
    /// extrusion, pressure advance and a possible reversal in the
    /// decelerating phase. Sub-step moves park their material in the shaper
    /// and report no steps.
    pub fn prepare_extruder(
        &mut self,
        dda: &Dda,
        params: &PrepParams,
        steps_per_mm: f64,
        shaper: &mut ExtruderShaper,
    ) -> bool {
        let drive = self.drive as usize;
        let component = dda.direction_vector[drive];
        self.distance_so_far = shaper.extrusion_pending() / component;

        let effective_steps_per_mm = steps_per_mm * component.abs();
        let effective_mm_per_step = 1.0 / effective_steps_per_mm;
        let mut cart = CartParams {
            effective_steps_per_mm,
            effective_mm_per_step,
            pressure_advance_k: 0.0,
            extra_extrusion_distance: 0.0,
        };

        let mut forward_distance = self.distance_so_far;
        let reverse_distance;

        if dda.flags.use_pressure_advance && shaper.k() > 0.0 {
            // Nonzero pressure advance; net movement must be forwards.
            cart.pressure_advance_k = shaper.k();
            cart.extra_extrusion_distance =
                cart.pressure_advance_k * dda.acceleration * params.accel_clocks;
            forward_distance += cart.extra_extrusion_distance;

            match move_segment::first_decel_segment(dda.extruder_segments()) {
                None => {
                    forward_distance += dda.total_distance;
                    reverse_distance = 0.0;
                }
                Some(decel_segment) => {
                    let initial_decel_speed =
                        dda.top_speed - cart.pressure_advance_k * dda.deceleration;
                    if initial_decel_speed <= 0.0 {
                        // The entire decelerating phase runs in reverse.
                        forward_distance += params.decel_start_distance;
                        reverse_distance = ((0.5 * dda.deceleration * params.decel_clocks)
                            - initial_decel_speed)
                            * params.decel_clocks;
                    } else {
                        // c is -2/deceleration, so -0.5*c is 1/deceleration.
                        let time_to_reverse = initial_decel_speed * (-0.5 * decel_segment.c());
                        if time_to_reverse < params.decel_clocks {
                            let distance_to_reverse =
                                0.5 * dda.deceleration * time_to_reverse * time_to_reverse;
                            forward_distance += params.decel_start_distance + distance_to_reverse;
                            let remaining = params.decel_clocks - time_to_reverse;
                            reverse_distance = 0.5 * dda.deceleration * remaining * remaining;
                        } else {
                            forward_distance += dda.total_distance
                                - (cart.pressure_advance_k
                                    * dda.deceleration
                                    * params.decel_clocks);
                            reverse_distance = 0.0;
                        }
                    }
                }
            }
        } else {
            // No pressure advance. Movement may be backwards but still
            // counts as forward distance here.
            forward_distance += dda.total_distance;
            reverse_distance = 0.0;
        }

        // Check whether there are any whole steps at all.
        let forward_steps = forward_distance * effective_steps_per_mm;
        if reverse_distance > 0.0 {
            let net_distance = forward_distance - reverse_distance;
            let net_steps = (net_distance * effective_steps_per_mm) as i32;
            if net_steps == 0 && forward_steps <= 1.0 {
                // One step out and one step back; not worth pulsing.
                shaper.set_extrusion_pending(net_distance * component);
                return false;
            }

            self.reverse_start_step = forward_steps as u32 + 1;
            self.total_steps = (2.0 * self.reverse_start_step as f64 - forward_steps) as u32;
            shaper.set_extrusion_pending(
                (net_distance - net_steps as f64 * effective_mm_per_step) * component,
            );
        } else {
            if forward_steps >= 1.0 {
                self.total_steps = forward_steps as u32;
                shaper.set_extrusion_pending(
                    (forward_distance - self.total_steps as f64 * effective_mm_per_step)
                        * component,
                );
            } else if forward_steps <= -1.0 {
                self.total_steps = (-forward_steps) as u32;
                shaper.set_extrusion_pending(
                    (forward_distance + self.total_steps as f64 * effective_mm_per_step)
                        * component,
                );
            } else {
                shaper.set_extrusion_pending(forward_distance * component);
                return false;
            }
            self.reverse_start_step = self.total_steps + 1; // no reverse phase
        }

        self.time_so_far = 0.0;
        self.params = AxisParams::Cart(cart);
        self.is_extruder = true;
        self.direction = component >= 0.0;
        self.direction_changed = false;
        self.current_segment = if dda.extruder_segments().is_empty() {
            None
        } else {
            Some(0)
        };

        self.next_step = 0; // must precede the segment setup
        if !self.new_extruder_segment(dda) {
            return false;
        }

        self.next_step_time = 0;
        self.step_interval = 999_999; // large, so the first calculation is for a single step
        self.steps_till_recalc = 0;
        self.calc_next_step_time(dda)
    }

    /// Advance to the next step and compute its time. Returns false when
    /// the move is finished for this drive, or when the calculation has
    /// failed and the state is [`DmState::StepError`].
    pub fn calc_next_step_time(&mut self, dda: &Dda) -> bool {
        self.next_step += 1;
        if self.next_step <= self.total_steps {
            if self.steps_till_recalc != 0 {
                // Double/quad/octal stepping: the batch was computed on an
                // even grid, just walk it.
                self.steps_till_recalc -= 1;
                self.next_step_time += self.step_interval;
                return true;
            }
            self.calc_next_step_time_full(dda)
        } else {
            self.state = DmState::Idle;
            false
        }
    }

    fn calc_next_step_time_full(&mut self, dda: &Dda) -> bool {
        let mut steps_to_limit = self.phase_step_limit.wrapping_sub(self.next_step);

        // No steps left in this segment; move on to the next one.
        if steps_to_limit == 0 {
            let segment_count = self.segments(dda).len();
            self.advance_segment(segment_count);
            let more = if self.is_delta() {
                self.new_delta_segment(dda)
            } else if self.is_extruder {
                self.new_extruder_segment(dda)
            } else {
                self.new_cartesian_segment(dda)
            };
            if !more {
                self.state = DmState::StepError;
                self.next_step += 100_000_000; // identifiable in the diagnostic dump
                return false;
            }
        }

        if self.phase_step_limit > self.reverse_start_step {
            steps_to_limit = self.reverse_start_step.wrapping_sub(self.next_step);
        }

        let mut shift_factor = 0u32; // single stepping unless the rate demands more
        if steps_to_limit > 1 && self.step_interval < MIN_CALC_INTERVAL {
            if self.step_interval < MIN_CALC_INTERVAL / 4 && steps_to_limit > 8 {
                shift_factor = 3; // octal stepping
            } else if self.step_interval < MIN_CALC_INTERVAL / 2 && steps_to_limit > 4 {
                shift_factor = 2; // quad stepping
            } else if steps_to_limit > 2 {
                shift_factor = 1; // double stepping
            }
        }
        self.steps_till_recalc = (1u32 << shift_factor) - 1;

        let next_calc_step_time: f64 = match self.state {
            DmState::CartLinear => {
                self.p_b + (self.next_step + self.steps_till_recalc) as f64 * self.p_c
            }

            DmState::CartAccel => {
                self.p_b
                    + (self.p_a + self.p_c * (self.next_step + self.steps_till_recalc) as f64)
                        .max(0.0)
                        .sqrt()
            }

            DmState::CartDecelForwardsReversing if self.next_step <= self.reverse_start_step => {
                self.p_b
                    - (self.p_a + self.p_c * (self.next_step + self.steps_till_recalc) as f64)
                        .max(0.0)
                        .sqrt()
            }

            DmState::CartDecelForwardsReversing | DmState::CartDecelReverse => {
                if self.state == DmState::CartDecelForwardsReversing {
                    self.direction = false;
                    self.direction_changed = true;
                    self.state = DmState::CartDecelReverse;
                }
                let net = (2 * self.reverse_start_step)
                    .wrapping_sub(self.next_step)
                    .wrapping_add(self.steps_till_recalc);
                self.p_b + (self.p_a + self.p_c * net as f64).max(0.0).sqrt()
            }

            DmState::CartDecelNoReverse => {
                self.p_b
                    - (self.p_a + self.p_c * (self.next_step + self.steps_till_recalc) as f64)
                        .max(0.0)
                        .sqrt()
            }

            DmState::DeltaForwardsReversing
            | DmState::DeltaForwardsNoReverse
            | DmState::DeltaReverse => {
                if self.state == DmState::DeltaForwardsReversing
                    && self.next_step == self.reverse_start_step
                {
                    self.direction = false;
                    self.direction_changed = true;
                    self.state = DmState::DeltaReverse;
                }

                let direction = self.direction;
                let dir_z = dda.direction_vector[2];
                let ds = {
                    let AxisParams::Delta(delta) = &mut self.params else {
                        return false;
                    };
                    let steps = (1u32 << shift_factor) as f64;
                    if direction {
                        delta.hmz0s += steps;
                    } else {
                        delta.hmz0s -= steps;
                    }

                    let hmz0sc = delta.hmz0s * dir_z;
                    let t1 = delta.minus_aa_plus_bb_times_s + hmz0sc;
                    let t2a = delta.d2_minus_a2_minus_b2_times_s2 - delta.hmz0s * delta.hmz0s
                        + t1 * t1;
                    // Rounding can push the radicand just below zero near
                    // the apex and the tower baseline.
                    let t2 = if t2a > 0.0 { t2a.sqrt() } else { 0.0 };
                    if direction { t1 - t2 } else { t1 + t2 }
                };

                if ds < 0.0 {
                    self.state = DmState::StepError;
                    self.next_step += 110_000_000; // identifiable in the diagnostic dump
                    return false;
                }

                // Feed the distance-in-steps into the Cartesian formula for
                // the current segment.
                let p_c_ds = self.p_c * ds;
                let segment =
                    &self.segments(dda)[self.current_segment.expect("active segment")];
                if segment.is_linear() {
                    self.p_b + p_c_ds
                } else if segment.is_accelerating() {
                    self.p_b + (self.p_a + p_c_ds).max(0.0).sqrt()
                } else {
                    self.p_b - (self.p_a + p_c_ds).max(0.0).sqrt()
                }
            }

            DmState::Idle | DmState::StepError => return false,
        };
        let next_calc_step_time = next_calc_step_time as u32;

        // Crossing a phase boundary under high microstepping can make the
        // next step appear due before the previous one; clamp the interval.
        self.step_interval = if next_calc_step_time > self.next_step_time {
            (next_calc_step_time - self.next_step_time) >> shift_factor
        } else {
            0
        };
        self.next_step_time = next_calc_step_time - self.steps_till_recalc * self.step_interval;

        if next_calc_step_time > dda.clocks_needed {
            // A very low end speed makes the last step time sensitive to
            // rounding, and on a delta the penultimate step can suffer too;
            // pull those forward to the planned finish. Anything else late
            // is a genuine failure.
            if self.next_step + 1 >= self.total_steps {
                self.next_step_time = dda.clocks_needed;
            } else {
                self.state = DmState::StepError;
                self.next_step += 120_000_000; // identifiable in the diagnostic dump
                self.step_interval = next_calc_step_time; // record the late time for the report
                return false;
            }
        }

        true
    }
}

impl fmt::Display for DriveMovement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.state == DmState::Idle {
            return write!(f, "DM{}: not moving", self.drive);
        }
        write!(
            f,
            "DM{}{} dir={} steps={} next={} rev={} interval={} psl={} A={} B={} C={}",
            self.drive,
            if self.state == DmState::StepError {
                " err:"
            } else {
                ":"
            },
            if self.direction { 'F' } else { 'B' },
            self.total_steps,
            self.next_step,
            self.reverse_start_step,
            self.step_interval,
            self.phase_step_limit,
            self.p_a,
            self.p_b,
            self.p_c,
        )?;
        match &self.params {
            AxisParams::Delta(delta) => write!(
                f,
                " hmz0s={:.2} minusAaPlusBbTimesS={:.2} dSquaredMinusAsquaredMinusBsquared={:.2} drev={:.3}",
                delta.hmz0s,
                delta.minus_aa_plus_bb_times_s,
                delta.d2_minus_a2_minus_b2_times_s2,
                delta.reverse_start_distance,
            ),
            AxisParams::Cart(cart) => write!(f, " pa={:.2}", cart.pressure_advance_k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dda::MoveParams;
    use crate::kinematics::DeltaKinematics;

    const CLOCK: f64 = 1_000_000.0;

    fn plan(moves: &[f64], speed: f64, accel: f64, decel: f64, pa: bool) -> Dda {
        Dda::plan(
            &MoveParams {
                moves: moves.to_vec(),
                speed,
                acceleration: accel,
                deceleration: decel,
                end_speed: 0.0,
                use_pressure_advance: pa,
            },
            CLOCK,
        )
        .unwrap()
    }

    fn plan_ending_at(moves: &[f64], speed: f64, accel: f64, decel: f64, end: f64) -> Dda {
        Dda::plan(
            &MoveParams {
                moves: moves.to_vec(),
                speed,
                acceleration: accel,
                deceleration: decel,
                end_speed: end,
                use_pressure_advance: true,
            },
            CLOCK,
        )
        .unwrap()
    }

    // Step the drive to completion, recording each scheduled step time.
    fn run_to_completion(dm: &mut DriveMovement, dda: &Dda, mut prepared: bool) -> Vec<u32> {
        let mut times = Vec::new();
        while prepared {
            times.push(dm.next_step_time());
            assert!(
                times.len() <= dm.total_steps() as usize,
                "emitted more steps than planned"
            );
            prepared = dm.calc_next_step_time(dda);
        }
        times
    }

    fn assert_monotonic(times: &[u32]) {
        for pair in times.windows(2) {
            assert!(
                pair[1] + 1 >= pair[0],
                "step time went backwards: {} then {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn cartesian_trapezoid_emits_every_step() {
        let dda = plan(&[10.0, 0.0, 0.0], 50.0, 1000.0, 1000.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(0);
        let prepared = dm.prepare_cartesian_axis(&dda, &params, 80.0);
        assert!(prepared);
        assert_eq!(dm.total_steps(), 800);
        assert_eq!(dm.reverse_start_step(), 801);
        assert!(dm.direction());

        let times = run_to_completion(&mut dm, &dda, prepared);
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(times.len(), 800);
        assert_monotonic(&times);

        // First step when the axis has covered 1/80 mm from rest:
        // sqrt(2 * 0.0125 / 1000) seconds.
        assert!(
            (times[0] as i64 - 5000).abs() <= 1,
            "first step at {}",
            times[0]
        );
        // Finishes at the planned end of the move.
        let last = *times.last().unwrap();
        assert!(last <= dda.clocks_needed);
        assert!(last + 2 >= dda.clocks_needed, "last step at {}", last);
        // The move covers the whole distance.
        assert!((dm.distance_so_far - 10.0).abs() < 1e-9);
        assert!(!dm.direction_changed());
    }

    #[test]
    fn cruise_interval_is_constant() {
        let dda = plan(&[10.0, 0.0, 0.0], 50.0, 1000.0, 1000.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(0);
        let prepared = dm.prepare_cartesian_axis(&dda, &params, 80.0);
        let times = run_to_completion(&mut dm, &dda, prepared);

        // Steps 101..=700 are the 50 mm/s cruise at 80 steps/mm: 250 clocks
        // apart. Stay clear of the phase boundaries.
        for pair in times[110..690].windows(2) {
            let interval = pair[1] - pair[0];
            assert!(
                (interval as i64 - 250).abs() <= 1,
                "cruise interval {}",
                interval
            );
        }
    }

    #[test]
    fn fast_move_batches_step_calculations() {
        // 250 mm/s at 80 steps/mm is a 50-clock interval, well under the
        // octal-stepping threshold.
        let dda = plan(&[100.0, 0.0, 0.0], 250.0, 2000.0, 2000.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(0);
        let prepared = dm.prepare_cartesian_axis(&dda, &params, 80.0);
        assert!(prepared);
        assert_eq!(dm.total_steps(), 8000);

        let times = run_to_completion(&mut dm, &dda, prepared);
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(times.len(), 8000);
        assert_monotonic(&times);
        for pair in times[3000..5000].windows(2) {
            let interval = pair[1] - pair[0];
            assert!(
                (interval as i64 - 50).abs() <= 1,
                "cruise interval {}",
                interval
            );
        }
        assert!(*times.last().unwrap() <= dda.clocks_needed);
    }

    #[test]
    fn delta_pure_z_descent_never_reverses() {
        let towers = DeltaKinematics::from_geometry(100.0, 200.0);
        let dda = plan(&[0.0, 0.0, -5.0], 20.0, 500.0, 500.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, Some(&towers));
        let mut dm = DriveMovement::new(0);
        let prepared = dm.prepare_delta_axis(&dda, &params, 80.0);
        assert!(prepared);
        assert_eq!(dm.total_steps(), 400);
        assert!(!dm.direction());
        assert_eq!(dm.reverse_start_step(), dm.total_steps() + 1);
        let AxisParams::Delta(delta) = &dm.params else {
            panic!("expected delta params");
        };
        assert_eq!(delta.reverse_start_distance, -1.0);

        let times = run_to_completion(&mut dm, &dda, prepared);
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(times.len(), 400);
        assert_monotonic(&times);
        assert!(!dm.direction_changed());
    }

    #[test]
    fn delta_pure_z_matches_cartesian_profile() {
        // On a pure Z move every carriage mirrors the Z axis exactly, so
        // the delta solver must reproduce the Cartesian timing.
        let towers = DeltaKinematics::from_geometry(100.0, 200.0);
        let dda = plan(&[0.0, 0.0, -5.0], 20.0, 500.0, 500.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, Some(&towers));

        let mut delta_dm = DriveMovement::new(1);
        let prepared = delta_dm.prepare_delta_axis(&dda, &params, 80.0);
        let delta_times = run_to_completion(&mut delta_dm, &dda, prepared);

        let mut cart_dm = DriveMovement::new(2);
        let prepared = cart_dm.prepare_cartesian_axis(&dda, &params, 80.0);
        let cart_times = run_to_completion(&mut cart_dm, &dda, prepared);

        assert_eq!(delta_times.len(), cart_times.len());
        for (i, (d, c)) in delta_times.iter().zip(cart_times.iter()).enumerate() {
            assert!(
                (*d as i64 - *c as i64).abs() <= 1,
                "step {} differs: delta {} cartesian {}",
                i,
                d,
                c
            );
        }
    }

    #[test]
    fn delta_apex_crossing_reverses_once() {
        let towers = DeltaKinematics::from_geometry(100.0, 200.0);
        // A straight X line passing under tower 2 (which sits on the +Y
        // axis): its carriage rises, tops out mid-move, then descends.
        let dda = plan(&[40.0, 0.0, 0.0], 30.0, 800.0, 800.0, false);
        let params = PrepParams::new(&dda, -20.0, 0.0, Some(&towers));
        let mut dm = DriveMovement::new(2);
        let prepared = dm.prepare_delta_axis(&dda, &params, 80.0);
        assert!(prepared);

        let reverse_start = dm.reverse_start_step();
        assert!(reverse_start > 1);
        assert!(reverse_start <= dm.total_steps());
        assert!(dm.direction(), "must start upwards");

        let mut times = Vec::new();
        let mut heights = Vec::new();
        let mut flips = 0;
        let mut last_direction = dm.direction();
        let mut alive = prepared;
        while alive {
            times.push(dm.next_step_time());
            let AxisParams::Delta(delta) = &dm.params else {
                panic!("expected delta params");
            };
            heights.push(delta.hmz0s);
            if dm.direction() != last_direction {
                flips += 1;
                last_direction = dm.direction();
            }
            alive = dm.calc_next_step_time(&dda);
        }

        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(times.len(), dm.total_steps() as usize);
        assert_eq!(flips, 1, "direction must flip exactly once");
        assert!(dm.direction_changed());
        assert!(!dm.direction(), "must finish downwards");
        assert_monotonic(&times);

        // The carriage tops out on the last step before the pivot.
        let peak_index = heights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak_index as u32, reverse_start - 2);
        assert!(*times.last().unwrap() <= dda.clocks_needed);
    }

    #[test]
    fn extruder_pressure_advance_extends_the_accel_phase() {
        // 50 mm/s reached at 500 mm/s^2 takes 0.1 s, so K = 0.04 adds
        // 0.04 * 500 * 0.1 = 2 mm of extra extrusion. Ending above
        // K * deceleration keeps the whole move forwards.
        let mut shaper = ExtruderShaper::new(0.04 * CLOCK);
        let dda = plan_ending_at(&[0.0, 0.0, 0.0, 10.0], 50.0, 500.0, 500.0, 25.0);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(3);
        let prepared = dm.prepare_extruder(&dda, &params, 80.0, &mut shaper);
        assert!(prepared);

        let AxisParams::Cart(cart) = &dm.params else {
            panic!("expected cartesian params");
        };
        assert!((cart.extra_extrusion_distance - 2.0).abs() < 1e-9);
        assert_eq!(dm.reverse_start_step(), dm.total_steps() + 1);

        let times = run_to_completion(&mut dm, &dda, prepared);
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(times.len(), dm.total_steps() as usize);
        assert!(!dm.direction_changed());
        assert_monotonic(&times);
        assert!(*times.last().unwrap() <= dda.clocks_needed);
    }

    #[test]
    fn extruder_full_decel_reversal_books_the_reverse_distance() {
        // K * deceleration = 0.04 * 2000 = 80 mm/s exceeds the 50 mm/s top
        // speed, so the whole decelerating phase runs in reverse. Carried
        // pending extrusion keeps the step counts clear of rounding
        // boundaries.
        let mut shaper = ExtruderShaper::new(0.04 * CLOCK);
        shaper.set_extrusion_pending(0.006);
        let dda = plan(&[0.0, 0.0, 0.0, 10.0], 50.0, 1000.0, 2000.0, true);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(3);
        let prepared = dm.prepare_extruder(&dda, &params, 80.0, &mut shaper);
        assert!(prepared);

        // forward distance: 0.006 pending + 2 mm advance + 9.375 mm to the
        // decel point = 11.381 mm, 910.48 steps
        let reverse_start = dm.reverse_start_step();
        assert_eq!(reverse_start, 911);
        assert_eq!(dm.total_steps(), 911);
        // 1.375 mm of reverse travel leaves a 10.006 mm net move; the
        // 0.48-step residual goes back to the shaper.
        assert!((shaper.extrusion_pending() - 0.006).abs() < 1e-9);

        let mut steps = 0usize;
        let mut alive = prepared;
        while alive {
            steps += 1;
            alive = dm.calc_next_step_time(&dda);
        }
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(steps, dm.total_steps() as usize);
    }

    #[test]
    fn extruder_without_advance_steps_the_whole_length() {
        let mut shaper = ExtruderShaper::new(0.0);
        let dda = plan(&[0.0, 0.0, 0.0, 10.0], 50.0, 1000.0, 1000.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(3);
        let prepared = dm.prepare_extruder(&dda, &params, 80.0, &mut shaper);
        assert!(prepared);
        assert_eq!(dm.total_steps(), 800);
        assert_eq!(dm.reverse_start_step(), 801);

        let times = run_to_completion(&mut dm, &dda, prepared);
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(times.len(), 800);
        assert_monotonic(&times);
        assert!(*times.last().unwrap() <= dda.clocks_needed);
        assert!(shaper.extrusion_pending().abs() < 1e-9);
    }

    #[test]
    fn decel_reversal_flips_direction_and_uses_the_pivot() {
        // Drive the reversal crossing directly: a decelerating drive one
        // step short of its pivot must flip, latch the change, and time the
        // next step from the mirrored step index.
        let dda = plan(&[0.0, 0.0, 0.0, 10.0], 50.0, 1000.0, 1000.0, false);
        let mut dm = DriveMovement::new(3);
        dm.params = AxisParams::Cart(CartParams {
            effective_steps_per_mm: 80.0,
            effective_mm_per_step: 1.0 / 80.0,
            pressure_advance_k: 0.0,
            extra_extrusion_distance: 0.0,
        });
        dm.is_extruder = true;
        dm.state = DmState::CartDecelForwardsReversing;
        dm.direction = true;
        dm.current_segment = Some(dda.extruder_segments().len() - 1);
        dm.total_steps = 10;
        dm.reverse_start_step = 5;
        dm.phase_step_limit = 11;
        dm.next_step = 5;
        dm.next_step_time = 9_000;
        dm.step_interval = 999_999;
        dm.steps_till_recalc = 0;
        dm.p_a = 1000.0;
        dm.p_b = 10_000.0;
        dm.p_c = -100.0;

        assert!(dm.calc_next_step_time(&dda));
        assert_eq!(dm.state(), DmState::CartDecelReverse);
        assert!(!dm.direction());
        assert!(dm.direction_changed());
        // net index 2*5 - 6 = 4: t = 10000 + sqrt(1000 - 400)
        assert_eq!(dm.next_step(), 6);
        assert_eq!(dm.next_step_time(), 10_024);
    }

    #[test]
    fn sub_step_extrusion_is_parked_in_the_shaper() {
        let mut shaper = ExtruderShaper::new(0.0);
        shaper.set_extrusion_pending(0.004);
        let dda = plan(&[0.0, 0.0, 0.0, 0.005], 20.0, 500.0, 500.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(3);
        let prepared = dm.prepare_extruder(&dda, &params, 80.0, &mut shaper);
        assert!(!prepared);
        assert_eq!(dm.total_steps(), 0);
        assert!((shaper.extrusion_pending() - 0.009).abs() < 1e-12);
    }

    #[test]
    fn poisoned_delta_geometry_raises_a_step_error() {
        let towers = DeltaKinematics::from_geometry(100.0, 200.0);
        let dda = plan(&[40.0, 0.0, 0.0], 30.0, 800.0, 800.0, false);
        let params = PrepParams::new(&dda, -20.0, 0.0, Some(&towers));
        let mut dm = DriveMovement::new(2);
        assert!(dm.prepare_delta_axis(&dda, &params, 80.0));

        // Corrupt the geometry so the next calculation sees an impossible
        // carriage position.
        let AxisParams::Delta(delta) = &mut dm.params else {
            panic!("expected delta params");
        };
        delta.minus_aa_plus_bb_times_s = -1e9;

        assert!(!dm.calc_next_step_time(&dda));
        assert_eq!(dm.state(), DmState::StepError);
        assert!(dm.next_step() >= 110_000_000);
        assert!(dm.next_step() < 120_000_000);
    }

    #[test]
    fn running_out_of_segments_raises_a_step_error() {
        let dda = plan(&[10.0, 0.0, 0.0], 50.0, 1000.0, 1000.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(0);
        assert!(dm.prepare_cartesian_axis(&dda, &params, 80.0));

        // Pretend the final segment is already active and exhausted while
        // steps remain.
        dm.current_segment = Some(dda.axis_segments().len() - 1);
        dm.phase_step_limit = dm.next_step() + 1;
        dm.steps_till_recalc = 0;

        assert!(!dm.calc_next_step_time(&dda));
        assert_eq!(dm.state(), DmState::StepError);
        assert!(dm.next_step() >= 100_000_000);
        assert!(dm.next_step() < 110_000_000);
    }

    #[test]
    fn late_mid_move_step_raises_a_step_error() {
        let dda = plan(&[10.0, 0.0, 0.0], 50.0, 1000.0, 1000.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(0);
        assert!(dm.prepare_cartesian_axis(&dda, &params, 80.0));

        // Push the next calculated time past the end of the move while
        // many steps remain.
        dm.p_b += 1e9;
        dm.steps_till_recalc = 0;

        assert!(!dm.calc_next_step_time(&dda));
        assert_eq!(dm.state(), DmState::StepError);
        assert!(dm.next_step() >= 120_000_000);
    }

    #[test]
    fn diagnostic_dump_reports_the_phase() {
        let dda = plan(&[10.0, 0.0, 0.0], 50.0, 1000.0, 1000.0, false);
        let params = PrepParams::new(&dda, 0.0, 0.0, None);
        let mut dm = DriveMovement::new(0);
        assert!(dm.prepare_cartesian_axis(&dda, &params, 80.0));
        let dump = format!("{}", dm);
        assert!(dump.starts_with("DM0:"), "{}", dump);
        assert!(dump.contains("steps=800"), "{}", dump);
        assert!(dump.contains("pa=0.00"), "{}", dump);

        let idle = DriveMovement::new(4);
        assert_eq!(format!("{}", idle), "DM4: not moving");
    }
}
