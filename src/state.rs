use log::debug;

/// Logical machine axis. The device's hardware axes are swapped relative to
/// these; the swap happens in the protocol codec, nothing above it needs to
/// care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

/// Tri-state limit switch flag for one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    Negative,
    #[default]
    None,
    Positive,
}

impl Limit {
    pub fn sign(self) -> i64 {
        match self {
            Self::Negative => -1,
            Self::None => 0,
            Self::Positive => 1,
        }
    }

    pub fn from_sign(sign: i64) -> Self {
        if sign > 0 {
            Self::Positive
        } else if sign < 0 {
            Self::Negative
        } else {
            Self::None
        }
    }
}

/// One saved copy of the mutable machine configuration, pushed by
/// `Controller::save_state` and reapplied by `Controller::restore_state`.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub position: (i64, i64),
    pub steps_per_unit: f64,
    pub speed_sps: i64,
    pub head_down: bool,
    pub spindle_on: bool,
    pub spindle_speed: u8,
}

/// Authoritative record of where the machine is and how it is configured.
///
/// Position is stored in steps and is only ever updated from parsed device
/// acknowledgements. The delta the device reports can be shorter than the
/// delta that was commanded (limit switch mid-move), so the command itself is
/// never trusted.
#[derive(Debug, Clone)]
pub struct MachineState {
    position: (i64, i64),
    steps_per_unit: f64,
    speed_sps: i64,
    head_down: bool,
    spindle_on: bool,
    spindle_speed: u8,
    limits: (Limit, Limit),
    saved: Vec<Snapshot>,
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineState {
    pub fn new() -> Self {
        Self {
            position: (0, 0),
            steps_per_unit: 1.0,
            speed_sps: 0,
            head_down: false,
            spindle_on: false,
            spindle_speed: 0,
            limits: (Limit::None, Limit::None),
            saved: Vec::new(),
        }
    }

    pub fn set_units(&mut self, steps_per_unit: f64) {
        debug!("units set to {steps_per_unit} steps/unit");
        self.steps_per_unit = steps_per_unit;
    }

    pub fn steps_per_unit(&self) -> f64 {
        self.steps_per_unit
    }

    pub fn to_steps(&self, units: f64) -> f64 {
        units * self.steps_per_unit
    }

    pub fn to_units(&self, steps: f64) -> f64 {
        steps / self.steps_per_unit
    }

    pub fn to_units_pair(&self, steps: (i64, i64)) -> (f64, f64) {
        (self.to_units(steps.0 as f64), self.to_units(steps.1 as f64))
    }

    pub fn to_steps_pair(&self, units: (f64, f64)) -> (i64, i64) {
        (
            self.to_steps(units.0).round() as i64,
            self.to_steps(units.1).round() as i64,
        )
    }

    /// Position in steps.
    pub fn position(&self) -> (i64, i64) {
        self.position
    }

    /// Position in the current unit.
    pub fn position_units(&self) -> (f64, f64) {
        self.to_units_pair(self.position)
    }

    /// Accumulate an acknowledged delta (steps) onto the known position.
    pub fn apply_delta(&mut self, delta: (i64, i64)) {
        self.position.0 += delta.0;
        self.position.1 += delta.1;
    }

    /// Re-zero the coordinate frame on the current physical position.
    pub fn zero_here(&mut self) {
        debug!(
            "zeroing here (was {},{} steps)",
            self.position.0, self.position.1
        );
        self.position = (0, 0);
    }

    pub fn limits(&self) -> (Limit, Limit) {
        self.limits
    }

    pub fn limit(&self, axis: Axis) -> Limit {
        match axis {
            Axis::X => self.limits.0,
            Axis::Y => self.limits.1,
        }
    }

    pub fn set_limit(&mut self, axis: Axis, limit: Limit) {
        match axis {
            Axis::X => self.limits.0 = limit,
            Axis::Y => self.limits.1 = limit,
        }
        debug!("limits now ({:?},{:?})", self.limits.0, self.limits.1);
    }

    /// Motion whose sign opposes an active limit clears that limit flag.
    /// Must run before a move is evaluated, otherwise the tripped switch
    /// would block all further motion on the axis.
    pub fn clear_opposing_limits(&mut self, delta: (i64, i64)) {
        if self.limits.0 != Limit::None && delta.0 * self.limits.0.sign() < 0 {
            self.limits.0 = Limit::None;
        }
        if self.limits.1 != Limit::None && delta.1 * self.limits.1.sign() < 0 {
            self.limits.1 = Limit::None;
        }
    }

    pub fn speed_sps(&self) -> i64 {
        self.speed_sps
    }

    pub fn set_speed_sps(&mut self, sps: i64) {
        self.speed_sps = sps;
    }

    pub fn head_down(&self) -> bool {
        self.head_down
    }

    pub fn set_head_down(&mut self, down: bool) {
        self.head_down = down;
    }

    pub fn spindle_on(&self) -> bool {
        self.spindle_on
    }

    pub fn set_spindle_on(&mut self, on: bool) {
        self.spindle_on = on;
    }

    pub fn spindle_speed(&self) -> u8 {
        self.spindle_speed
    }

    pub fn set_spindle_speed(&mut self, speed: u8) {
        self.spindle_speed = speed.min(99);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            position: self.position,
            steps_per_unit: self.steps_per_unit,
            speed_sps: self.speed_sps,
            head_down: self.head_down,
            spindle_on: self.spindle_on,
            spindle_speed: self.spindle_speed,
        }
    }

    /// Push a copy of the current configuration onto the save stack.
    pub fn push_snapshot(&mut self) {
        let snap = self.snapshot();
        self.saved.push(snap);
    }

    /// Pop the most recent save, or `None` when only the base state remains.
    pub fn pop_snapshot(&mut self) -> Option<Snapshot> {
        self.saved.pop()
    }

    /// Stack depth including the live base state.
    pub fn depth(&self) -> usize {
        self.saved.len() + 1
    }
}
