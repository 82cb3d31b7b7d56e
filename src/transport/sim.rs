use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use super::{Transport, TransportError};
use crate::config::MachineProfile;

/// Hardware-frame travel extents in steps, limit switch to limit switch.
/// Derived from the measured 300x350 mm bed at 157.48 steps/mm.
pub const MOVEABLE_WIDTH: i64 = 47244;
pub const MOVEABLE_HEIGHT: i64 = 55118;

/// How far a simulated jog travels between start and stop.
const DEFAULT_JOG_TRAVEL: i64 = 400;

/// Deterministic in-memory stand-in for a real controller.
///
/// Models the device in its own hardware frame: a bounded 2D position,
/// DA/CR+GO move acknowledgement, limit-switch truncation, and the error
/// response the real firmware gives a zero-delta move. Clones share the same
/// device, so a test can keep a handle for inspection after the controller
/// takes ownership of the transport.
#[derive(Clone)]
pub struct SimTransport {
    inner: Arc<Mutex<SimDevice>>,
}

struct SimDevice {
    pos: (i64, i64),
    bounds: (i64, i64),
    pending: Option<(i64, i64)>,
    queue: VecDeque<String>,
    jog: Option<(char, i64)>,
    jog_travel: i64,
    head_down: bool,
    spindle_on: bool,
    estop_armed: bool,
    error_armed: bool,
    transcript: Vec<String>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        Self::with_bounds(MOVEABLE_WIDTH, MOVEABLE_HEIGHT)
    }

    /// Bounds from a profile's bed extents. The profile speaks the logical
    /// frame, so its width maps to the hardware Y extent and vice versa.
    pub fn from_profile(profile: &MachineProfile) -> Self {
        Self::with_bounds(profile.bed_height_steps, profile.bed_width_steps)
    }

    pub fn with_bounds(width: i64, height: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimDevice {
                pos: (width / 2, height / 2),
                bounds: (width, height),
                pending: None,
                queue: VecDeque::new(),
                jog: None,
                jog_travel: DEFAULT_JOG_TRAVEL,
                head_down: false,
                spindle_on: false,
                estop_armed: false,
                error_armed: false,
                transcript: Vec::new(),
            })),
        }
    }

    /// Place the virtual head, in hardware-frame steps.
    pub fn set_position(&self, pos: (i64, i64)) {
        self.inner.lock().unwrap().pos = pos;
    }

    /// Current hardware-frame position.
    pub fn position(&self) -> (i64, i64) {
        self.inner.lock().unwrap().pos
    }

    pub fn head_down(&self) -> bool {
        self.inner.lock().unwrap().head_down
    }

    pub fn spindle_on(&self) -> bool {
        self.inner.lock().unwrap().spindle_on
    }

    pub fn set_jog_travel(&self, steps: i64) {
        self.inner.lock().unwrap().jog_travel = steps;
    }

    /// The next GO answers with an emergency stop instead of moving.
    pub fn arm_emergency_stop(&self) {
        self.inner.lock().unwrap().estop_armed = true;
    }

    /// The next GO answers with an error line instead of moving.
    pub fn arm_device_error(&self) {
        self.inner.lock().unwrap().error_armed = true;
    }

    /// Every line written so far, oldest first.
    pub fn transcript(&self) -> Vec<String> {
        self.inner.lock().unwrap().transcript.clone()
    }
}

impl SimDevice {
    fn respond(&mut self, line: String) {
        self.queue.push_back(line);
    }

    fn handle(&mut self, line: &str) {
        if line == "IM" {
            self.head_down = false;
            self.spindle_on = false;
            self.pending = None;
            self.jog = None;
        } else if line == "HD" {
            self.head_down = true;
            self.respond("OK0,0,0".into());
        } else if line == "HU" {
            self.head_down = false;
            self.respond("OK0,0,0".into());
        } else if line == "MO1" {
            self.spindle_on = true;
        } else if line == "MO0" {
            self.spindle_on = false;
        } else if let Some(rest) = line.strip_prefix("DA") {
            self.pending = parse_pair(rest);
        } else if let Some(rest) = line.strip_prefix("CR") {
            // Arcs are acknowledged by their endpoint delta; the simulator
            // does not model the curved path itself.
            let fields: Vec<&str> = rest.split(',').collect();
            if fields.len() == 7 {
                self.pending = match (fields[3].parse(), fields[4].parse()) {
                    (Ok(dx), Ok(dy)) => Some((dx, dy)),
                    _ => None,
                };
            }
        } else if line == "GO" {
            self.execute_go();
        } else if let Some(rest) = line.strip_prefix("JA") {
            self.handle_jog(rest);
        }
        // VS/VM/AT/SS/VJ/EO0 are accepted silently, like the real firmware.
    }

    fn execute_go(&mut self) {
        if self.estop_armed {
            self.estop_armed = false;
            self.pending = None;
            self.respond("ES0,0,0".into());
            return;
        }
        if self.error_armed {
            self.error_armed = false;
            self.pending = None;
            self.respond("ER3".into());
            return;
        }
        let Some((dx, dy)) = self.pending.take() else {
            self.respond("ER0".into());
            return;
        };
        if dx == 0 && dy == 0 {
            // The real controller locks up on DA0,0,0; answer with an error
            // so a buggy caller fails loudly instead of hanging.
            self.respond("ER0".into());
            return;
        }
        let (ax, ay) = self.travel((dx, dy));
        if ax != dx {
            let dir = if dx > 0 { '+' } else { '-' };
            self.respond(format!("LIX{dir},{ax},{ay},0"));
            self.respond("OK0,0,0".into());
        } else if ay != dy {
            let dir = if dy > 0 { '+' } else { '-' };
            self.respond(format!("LIY{dir},{ax},{ay},0"));
            self.respond("OK0,0,0".into());
        } else {
            self.respond(format!("OK{ax},{ay},0"));
        }
    }

    fn handle_jog(&mut self, rest: &str) {
        let mut chars = rest.chars();
        let (Some(axis), Some(dir)) = (chars.next(), chars.next()) else {
            self.respond("ER0".into());
            return;
        };
        match dir {
            '+' => self.jog = Some((axis, 1)),
            '-' => self.jog = Some((axis, -1)),
            '0' => {
                let moved = match self.jog {
                    Some((jog_axis, sign)) if jog_axis == axis => {
                        self.jog = None;
                        let quantum = sign * self.jog_travel;
                        if axis == 'X' {
                            self.travel((quantum, 0))
                        } else {
                            self.travel((0, quantum))
                        }
                    }
                    _ => (0, 0),
                };
                self.respond(format!("OK{},{},0", moved.0, moved.1));
            }
            _ => self.respond("ER0".into()),
        }
    }

    /// Move within travel bounds and return the delta actually covered.
    fn travel(&mut self, (dx, dy): (i64, i64)) -> (i64, i64) {
        let nx = (self.pos.0 + dx).clamp(0, self.bounds.0);
        let ny = (self.pos.1 + dy).clamp(0, self.bounds.1);
        let actual = (nx - self.pos.0, ny - self.pos.1);
        self.pos = (nx, ny);
        actual
    }
}

fn parse_pair(s: &str) -> Option<(i64, i64)> {
    let fields: Vec<&str> = s.split(',').collect();
    if fields.len() != 3 {
        return None;
    }
    match (fields[0].parse(), fields[1].parse()) {
        (Ok(x), Ok(y)) => Some((x, y)),
        _ => None,
    }
}

impl Transport for SimTransport {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut dev = self.inner.lock().unwrap();
        debug!("sim W {line}");
        dev.transcript.push(line.to_string());
        dev.handle(line);
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        // Responses are synthesized synchronously, so an empty queue means a
        // real device would have timed out too. No need to actually sleep.
        let mut dev = self.inner.lock().unwrap();
        match dev.queue.pop_front() {
            Some(line) => {
                debug!("sim R {line}");
                Ok(line)
            }
            None => Err(TransportError::Timeout(timeout)),
        }
    }

    fn bytes_waiting(&mut self) -> usize {
        let dev = self.inner.lock().unwrap();
        dev.queue.iter().map(|l| l.len() + 1).sum()
    }

    fn discard_waiting(&mut self) {
        self.inner.lock().unwrap().queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn go(sim: &mut SimTransport, dx: i64, dy: i64) -> Vec<String> {
        sim.write_line(&format!("DA{dx},{dy},0")).unwrap();
        sim.write_line("GO").unwrap();
        let mut lines = Vec::new();
        while let Ok(line) = sim.read_line(Duration::from_millis(1)) {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn in_bounds_move_acknowledged_in_full() {
        let mut sim = SimTransport::with_bounds(10000, 10000);
        sim.set_position((5000, 5000));
        assert_eq!(go(&mut sim, 100, -200), vec!["OK100,-200,0"]);
        assert_eq!(sim.position(), (5100, 4800));
    }

    #[test]
    fn move_past_bound_reports_limit_and_truncates() {
        let mut sim = SimTransport::with_bounds(10000, 10000);
        sim.set_position((9600, 5000));
        assert_eq!(go(&mut sim, 1000, 0), vec!["LIX+,400,0,0", "OK0,0,0"]);
        assert_eq!(sim.position(), (10000, 5000));
    }

    #[test]
    fn profile_bed_extents_set_the_bounds() {
        let profile = MachineProfile {
            bed_width_steps: 2000,
            bed_height_steps: 1000,
            ..Default::default()
        };
        let mut sim = SimTransport::from_profile(&profile);
        sim.set_position((0, 0));
        // The logical bed width is the hardware Y extent
        assert_eq!(go(&mut sim, 0, 3000), vec!["LIY+,0,2000,0", "OK0,0,0"]);
        assert_eq!(go(&mut sim, 1500, 0), vec!["LIX+,1000,0,0", "OK0,0,0"]);
    }

    #[test]
    fn default_profile_matches_the_measured_bed() {
        let sim = SimTransport::from_profile(&MachineProfile::default());
        // Same extents as SimTransport::new(), head centred on the bed
        assert_eq!(sim.position(), (MOVEABLE_WIDTH / 2, MOVEABLE_HEIGHT / 2));
    }

    #[test]
    fn zero_move_answers_error() {
        let mut sim = SimTransport::with_bounds(10000, 10000);
        assert_eq!(go(&mut sim, 0, 0), vec!["ER0"]);
    }

    #[test]
    fn jog_stop_reports_travel() {
        let mut sim = SimTransport::with_bounds(10000, 10000);
        sim.set_position((5000, 5000));
        sim.set_jog_travel(250);
        sim.write_line("VJ1000").unwrap();
        sim.write_line("JAY-").unwrap();
        sim.write_line("JAX0").unwrap();
        sim.write_line("JAY0").unwrap();
        assert_eq!(sim.read_line(Duration::ZERO).unwrap(), "OK0,0,0");
        assert_eq!(sim.read_line(Duration::ZERO).unwrap(), "OK0,-250,0");
        assert_eq!(sim.position(), (5000, 4750));
    }

    #[test]
    fn head_commands_acknowledge() {
        let mut sim = SimTransport::new();
        sim.write_line("HD").unwrap();
        assert_eq!(sim.read_line(Duration::ZERO).unwrap(), "OK0,0,0");
        assert!(sim.head_down());
        sim.write_line("HU").unwrap();
        assert_eq!(sim.read_line(Duration::ZERO).unwrap(), "OK0,0,0");
        assert!(!sim.head_down());
    }
}
