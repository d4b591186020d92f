//! Fan curve calculations for temperature-based speed control.
//!
//! Maps a temperature to a raw EC fan speed (0-255) and limits how fast the
//! speed may move between updates.

use serde::{Deserialize, Serialize};

use crate::config::CurveCfg;

const MAX_ITERATIONS: usize = 32;
const EPSILON: f32 = 0.01;

/// Point in 2D space for fan curve calculations.
///
/// # Example
///
/// ```
/// use arm_ecd::fan_curve::Point;
///
/// let point = Point { x: 45.0, y: 120.0 }; // 45°C -> speed 120
/// let from_tuple: Point = (45.0, 120.0).into();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl From<(f32, f32)> for Point {
    fn from(value: (f32, f32)) -> Self {
        Self {
            x: value.0,
            y: value.1,
        }
    }
}

/// Temperature to speed mapping.
///
/// # Example
///
/// ```
/// use arm_ecd::fan_curve::FanCurve;
///
/// let step = FanCurve::StepCurve {
///     temps: vec![40.0, 60.0],
///     speeds: vec![50, 200],
/// };
/// assert_eq!(step.compute_speed(50.0), 125);
/// assert_eq!(step.compute_speed(90.0), 200);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum FanCurve {
    Constant(u8),
    StepCurve { temps: Vec<f32>, speeds: Vec<u8> },
    BezierCurve { points: [Point; 4] },
}

impl FanCurve {
    /// Speed for `temp`. Step curves hold their end values outside their range.
    pub fn compute_speed(&self, temp: f32) -> u8 {
        match self {
            FanCurve::Constant(speed) => *speed,
            FanCurve::StepCurve { temps, speeds } => step_speed(temps, speeds, temp),
            FanCurve::BezierCurve { points } => {
                let first = points[0].x;
                let last = points[3].x;
                get_speed_for_temp(points, temp.clamp(first.min(last), first.max(last)))
                    .round()
                    .clamp(0.0, 255.0) as u8
            }
        }
    }
}

impl TryFrom<&CurveCfg> for FanCurve {
    type Error = anyhow::Error;

    fn try_from(curve_cfg: &CurveCfg) -> Result<Self, Self::Error> {
        Ok(match curve_cfg {
            CurveCfg::Constant { speed } => FanCurve::Constant(*speed),
            CurveCfg::StepCurve { tmps, spds } => FanCurve::StepCurve {
                temps: tmps.clone(),
                speeds: spds.clone(),
            },
            CurveCfg::Bezier { points } => FanCurve::BezierCurve {
                points: points.as_slice().try_into().map_err(|_| {
                    anyhow::anyhow!("Bezier curve must have 4 points, got {}", points.len())
                })?,
            },
        })
    }
}

fn step_speed(temps: &[f32], speeds: &[u8], temp: f32) -> u8 {
    let (Some(&first_t), Some(&last_t)) = (temps.first(), temps.last()) else {
        return 0;
    };
    if temp <= first_t {
        return speeds[0];
    }
    if temp >= last_t {
        return speeds[speeds.len() - 1];
    }
    temps
        .windows(2)
        .zip(speeds.windows(2))
        .find_map(|(t, w)| {
            let (t0, t1) = (t[0], t[1]);
            let (s0, s1) = (w[0], w[1]);
            if (t0..=t1).contains(&temp) {
                let ratio = (temp - t0) / (t1 - t0);
                let speed = s0 as f32 * (1.0 - ratio) + s1 as f32 * ratio;
                Some(speed.round().clamp(0.0, 255.0) as u8)
            } else {
                None
            }
        })
        .unwrap_or(speeds[speeds.len() - 1])
}

/// Moves `current` toward `target` by at most `max_step`.
pub fn step_toward(current: u8, target: u8, max_step: u8) -> u8 {
    if target > current {
        current.saturating_add(max_step).min(target)
    } else {
        current.saturating_sub(max_step).max(target)
    }
}

fn compute_bezier_at_t(pts: &[Point; 4], t: f32) -> Point {
    let u = 1.0 - t;
    let tt = t * t;
    let uu = u * u;
    let uuu = uu * u;
    let ttt = tt * t;

    let x = uuu * pts[0].x + 3.0 * uu * t * pts[1].x + 3.0 * u * tt * pts[2].x + ttt * pts[3].x;

    let y = uuu * pts[0].y + 3.0 * uu * t * pts[1].y + 3.0 * u * tt * pts[2].y + ttt * pts[3].y;

    (x, y).into()
}

/// Finds the speed for a temperature on a cubic Bezier curve.
///
/// Bisects on `t` until the curve's x matches `temp`, then returns y.
pub fn get_speed_for_temp(pts: &[Point; 4], temp: f32) -> f32 {
    let mut t_low = 0.0_f32;
    let mut t_high = 1.0_f32;
    let mut t_mid = 0.0_f32;

    for _ in 0..MAX_ITERATIONS {
        t_mid = (t_low + t_high) * 0.5;
        let p = compute_bezier_at_t(pts, t_mid);

        if (p.x - temp).abs() < EPSILON {
            return p.y;
        }
        if p.x < temp {
            t_low = t_mid;
        } else {
            t_high = t_mid;
        }
    }

    compute_bezier_at_t(pts, t_mid).y
}
