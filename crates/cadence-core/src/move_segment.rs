//! Motion segments of a planned move.
//!
//! A move is a short list of segments with uniform dynamics: constant
//! velocity, or constant (de)acceleration. Each segment pre-computes the
//! coefficients needed to map a step index straight to a step time, so the
//! step generator never has to re-derive the velocity profile.

/// One immutable portion of a move.
///
/// For a linear segment the step time satisfies `t = B + C * n`; for a
/// ramp segment `t = B + sqrt(A + C * n)` (accelerating) or
/// `t = B - sqrt(A + C * n)` (decelerating), where `n` is the step index
/// counted from the start of the whole move. Lengths are in mm, times in
/// step-timer clocks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveSegment {
    length: f64,
    duration: f64,
    // Linear: c is clocks per mm. Ramp: c = 2/accel, b = -startSpeed/accel,
    // with accel signed (negative while decelerating).
    b: f64,
    c: f64,
    linear: bool,
}

impl MoveSegment {
    /// Constant-velocity segment covering `length` mm in `duration` clocks.
    pub fn linear(length: f64, duration: f64) -> Self {
        Self {
            length,
            duration,
            b: 0.0,
            c: duration / length,
            linear: true,
        }
    }

    /// Constant-acceleration segment starting at `start_speed` (mm/clock)
    /// with signed acceleration `accel` (mm/clock^2, negative to decelerate).
    pub fn ramp(length: f64, duration: f64, start_speed: f64, accel: f64) -> Self {
        Self {
            length,
            duration,
            b: -start_speed / accel,
            c: 2.0 / accel,
            linear: false,
        }
    }

    pub fn is_linear(&self) -> bool {
        self.linear
    }

    /// True for a ramp segment with positive acceleration.
    pub fn is_accelerating(&self) -> bool {
        !self.linear && self.c > 0.0
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Raw distance coefficient, in the per-mm domain.
    pub fn c(&self) -> f64 {
        self.c
    }

    /// Distance coefficient scaled so one step is the independent variable.
    pub fn calc_c(&self, mm_per_step: f64) -> f64 {
        self.c * mm_per_step
    }

    /// Offset term for a linear segment, absorbing the distance and time
    /// already covered by earlier segments.
    pub fn calc_linear_b(&self, start_distance: f64, start_time: f64) -> f64 {
        start_time - (start_distance * self.c)
    }

    /// Radicand offset for a ramp segment.
    pub fn calc_nonlinear_a(&self, start_distance: f64) -> f64 {
        (self.b * self.b) - (start_distance * self.c)
    }

    /// Radicand offset for a ramp segment driven with pressure advance `k`
    /// (k in clocks). Advance shifts the effective segment entry speed, so
    /// it appears in the radicand as well as the time offset.
    pub fn calc_nonlinear_a_with_pa(&self, start_distance: f64, k: f64) -> f64 {
        let bk = self.b - k;
        (bk * bk) - (start_distance * self.c)
    }

    /// Time offset for a ramp segment.
    pub fn calc_nonlinear_b(&self, start_time: f64) -> f64 {
        start_time + self.b
    }

    /// Time offset for a ramp segment driven with pressure advance `k`
    /// (k in clocks).
    pub fn calc_nonlinear_b_with_pa(&self, start_time: f64, k: f64) -> f64 {
        (start_time - k) + self.b
    }
}

/// Locate the first decelerating segment of a move, if any.
pub fn first_decel_segment(segments: &[MoveSegment]) -> Option<&MoveSegment> {
    segments
        .iter()
        .find(|seg| !seg.is_linear() && !seg.is_accelerating())
}
