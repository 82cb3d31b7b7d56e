//! Wire codec for the AMC2500's reverse-engineered ASCII line protocol.
//!
//! Everything above this module works in the logical coordinate frame; the
//! device's hardware X/Y axes are swapped relative to it (chosen so the bed's
//! natural orientation matches operator expectation). Every outgoing pair and
//! every incoming delta gets swapped here and nowhere else.

use crate::state::{Axis, Limit};

/// Steps per millimetre of head travel (0.00635 mm per step).
pub const STEPS_PER_MM: f64 = 1.0 / 0.00635;
pub const STEPS_PER_INCH: f64 = STEPS_PER_MM * 25.4;

/// Empirical scale between a sweep angle in radians and the integer the
/// CR command wants. Found by measuring engraved test arcs; unconfirmed.
pub const ANGLE_SCALE: f64 = 32770.0;

/// Handshake: initialize (head up, spindle off) and turn command echo off.
pub const INIT: &str = "IM";
pub const ECHO_OFF: &str = "EO0";

pub fn swap<T>(pair: (T, T)) -> (T, T) {
    (pair.1, pair.0)
}

fn hw_axis(axis: Axis) -> char {
    match axis {
        Axis::X => 'Y',
        Axis::Y => 'X',
    }
}

fn logical_axis(hw: char) -> Option<Axis> {
    match hw {
        'X' => Some(Axis::Y),
        'Y' => Some(Axis::X),
        _ => None,
    }
}

/// The VS/VM/AT triple is always sent together; the firmware treats a lone
/// VM change inconsistently.
pub fn speed_triple(vs: i64, vm: i64, at: i64) -> [String; 3] {
    [format!("VS{vs}"), format!("VM{vm}"), format!("AT{at}")]
}

/// Spindle speed, normalized 0-99.
pub fn spindle_speed(ss: u8) -> String {
    format!("SS{}", ss.min(99))
}

pub fn head(down: bool) -> &'static str {
    if down { "HD" } else { "HU" }
}

pub fn spindle(on: bool) -> &'static str {
    if on { "MO1" } else { "MO0" }
}

/// Linear move by a logical-frame step delta. Callers must have rejected the
/// zero delta already; DA0,0,0 wedges the firmware.
pub fn linear_move(delta: (i64, i64)) -> [String; 2] {
    let (hx, hy) = swap(delta);
    [format!("DA{hx},{hy},0"), "GO".to_string()]
}

/// Arc move: center offset and endpoint delta relative to the start point,
/// logical frame, plus the scaled sweep angle from [`arc_angle`].
pub fn arc_move(center: (i64, i64), delta: (i64, i64), angle: i64) -> [String; 2] {
    let (ci, cj) = swap(center);
    let (hx, hy) = swap(delta);
    [format!("CR{ci},{cj},0,{hx},{hy},0,{angle}"), "GO".to_string()]
}

pub fn jog_speed(sps: i64) -> String {
    format!("VJ{sps}")
}

/// Start (`sign` ±1) or stop (`sign` 0) jogging one logical axis.
pub fn jog(axis: Axis, sign: i64) -> String {
    let dir = if sign > 0 {
        '+'
    } else if sign < 0 {
        '-'
    } else {
        '0'
    };
    format!("JA{}{dir}", hw_axis(axis))
}

/// Signed central angle for an arc from `start` to `end` around `center`
/// (logical-frame step coordinates), scaled for the CR command. Positive
/// encodes clockwise, matching the requested winding direction.
pub fn arc_angle(start: (f64, f64), end: (f64, f64), center: (f64, f64), clockwise: bool) -> i64 {
    let a_start = (start.1 - center.1).atan2(start.0 - center.0);
    let a_end = (end.1 - center.1).atan2(end.0 - center.0);
    // atan2 angles grow counter-clockwise, so the clockwise sweep is
    // start minus end, wrapped into (0, tau].
    let diff = if clockwise { a_start - a_end } else { a_end - a_start };
    let mut sweep = diff.rem_euclid(std::f64::consts::TAU);
    if sweep == 0.0 {
        sweep = std::f64::consts::TAU;
    }
    let signed = if clockwise { sweep } else { -sweep };
    (signed * ANGLE_SCALE).round() as i64
}

/// One classified response line, deltas already in the logical frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `ES<dx>,<dy>,<dz>` - emergency stop button, motion halted.
    EmergencyStop { delta: (i64, i64) },
    /// `LI<axis><dir>,<dx>,<dy>,<dz>` - limit switch tripped mid-move.
    LimitHit {
        axis: Axis,
        limit: Limit,
        delta: (i64, i64),
    },
    /// `OK<dx>,<dy>,<dz>` - command completed, actual delta moved.
    Ok { delta: (i64, i64) },
    /// `ER...` - firmware error condition.
    Error(String),
    /// Anything else (noise, power-up banner).
    Unknown(String),
}

/// Classify one response line. Checked in priority order ES > LI > OK > ER;
/// exactly one classification applies per line.
pub fn classify(line: &str) -> Response {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("ES")
        && let Some(delta) = parse_delta(rest)
    {
        return Response::EmergencyStop { delta };
    }
    if let Some(rest) = line.strip_prefix("LI")
        && let Some(hit) = parse_limit(rest)
    {
        return hit;
    }
    if let Some(rest) = line.strip_prefix("OK")
        && let Some(delta) = parse_delta(rest)
    {
        return Response::Ok { delta };
    }
    if line.starts_with("ER") {
        return Response::Error(line.to_string());
    }

    Response::Unknown(line.to_string())
}

/// `<dx>,<dy>,<dz>` in the hardware frame; dz is parsed but dropped (the
/// head axis is not position-tracked).
fn parse_delta(s: &str) -> Option<(i64, i64)> {
    let fields: Vec<&str> = s.split(',').collect();
    if fields.len() != 3 {
        return None;
    }
    let hx: i64 = fields[0].trim().parse().ok()?;
    let hy: i64 = fields[1].trim().parse().ok()?;
    let _dz: i64 = fields[2].trim().parse().ok()?;
    Some(swap((hx, hy)))
}

fn parse_limit(rest: &str) -> Option<Response> {
    let mut chars = rest.chars();
    let axis = logical_axis(chars.next()?)?;
    let limit = match chars.next()? {
        '+' => Limit::Positive,
        '-' => Limit::Negative,
        _ => return None,
    };
    let rest = chars.as_str().strip_prefix(',')?;
    let delta = parse_delta(rest)?;
    Some(Response::LimitHit { axis, limit, delta })
}
