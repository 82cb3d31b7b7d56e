use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::config::{MachineProfile, SpeedProfile, Strictness};
use crate::error::Error;
use crate::protocol::{self, Response};
use crate::state::{Axis, Limit, MachineState};
use crate::transport::{SerialTransport, Transport, TransportError};

/// Plenty for HD/HU and jog stops; moves get their own longer timeout.
const SHORT_TIMEOUT: Duration = Duration::from_millis(500);
/// A full-bed move at the slowest usable speed takes minutes.
const MOVE_TIMEOUT: Duration = Duration::from_secs(180);
/// Grace between response polls while the UART drains.
const POLL_SLEEP: Duration = Duration::from_millis(10);

/// Fastest speed the head moves reliably, steps/second.
const MAX_SPEED_SPS: i64 = 8000;

const SEARCH_FAST_SPS: i64 = 8000;
const SEARCH_SLOW_SPS: i64 = 250;
const SEARCH_COARSE_STEPS: i64 = 80_000;
const SEARCH_FINE_STEPS: i64 = 1_000;
/// The coarse sweep covers the whole bed in one hop; anything near this many
/// iterations means the limit switch is not reporting.
const MAX_SEARCH_MOVES: usize = 32;

/// Tool-change excursions hop 200 mm at a time until a limit stops them.
const TOOL_CHANGE_HOP_STEPS: i64 = 31_496;
const MAX_TOOL_CHANGE_HOPS: usize = 32;

const MIN_RPM: f64 = 1000.0;
const MAX_RPM: f64 = 5000.0;

/// Accumulated result of one command round-trip.
struct Ack {
    delta: (i64, i64),
    limit: Option<(Axis, Limit)>,
}

/// Façade over transport, codec and machine state: motion primitives,
/// head/spindle control, homing, and the save/restore stack.
///
/// One controller exclusively owns its transport for the session lifetime
/// and is strictly single-threaded; commands block until the device
/// acknowledges or the timeout elapses.
pub struct Controller {
    transport: Box<dyn Transport>,
    state: MachineState,
    speed_profile: SpeedProfile,
    strictness: Strictness,
    head_settle: Duration,
    spindle_settle: Duration,
    jogging: bool,
}

/// Open the configured serial port and run the handshake.
pub fn connect(profile: &MachineProfile) -> Result<Controller, Error> {
    let transport = SerialTransport::open(&profile.port)?;
    Controller::with_profile(Box::new(transport), profile)
}

impl Controller {
    pub fn new(transport: Box<dyn Transport>) -> Result<Self, Error> {
        Self::with_profile(transport, &MachineProfile::default())
    }

    pub fn with_profile(
        transport: Box<dyn Transport>,
        profile: &MachineProfile,
    ) -> Result<Self, Error> {
        let mut controller = Self {
            transport,
            state: MachineState::new(),
            speed_profile: profile.speed,
            strictness: profile.strictness,
            head_settle: Duration::from_millis(profile.head_settle_ms),
            spindle_settle: Duration::from_millis(profile.spindle_settle_ms),
            jogging: false,
        };
        debug!("initialising controller");
        controller.transport.discard_waiting();
        controller.handshake(profile.initial_speed_sps)?;
        Ok(controller)
    }

    fn handshake(&mut self, initial_sps: i64) -> Result<(), Error> {
        self.command(protocol::INIT)?;
        self.drain_responses()?;
        self.command(protocol::ECHO_OFF)?;
        self.drain_responses()?;
        // IM leaves the head up and the spindle off
        self.state.set_head_down(false);
        self.state.set_spindle_on(false);
        self.set_speed_sps(initial_sps, true)
    }

    /// Read-only view of the tracked machine state, for status displays.
    pub fn state(&self) -> &MachineState {
        &self.state
    }

    /// Estimated absolute head position in the current unit.
    pub fn position(&self) -> (f64, f64) {
        self.state.position_units()
    }

    pub fn limits(&self) -> (Limit, Limit) {
        self.state.limits()
    }

    // --- units ---

    pub fn set_units(&mut self, steps_per_unit: f64) {
        self.state.set_units(steps_per_unit);
    }

    pub fn set_units_mm(&mut self) {
        self.set_units(protocol::STEPS_PER_MM);
    }

    pub fn set_units_inches(&mut self) {
        self.set_units(protocol::STEPS_PER_INCH);
    }

    pub fn set_units_steps(&mut self) {
        self.set_units(1.0);
    }

    // --- speed and spindle ---

    /// Head speed in the current unit per second. No-op when the speed is
    /// already current.
    pub fn set_speed(&mut self, speed: f64) -> Result<(), Error> {
        let sps = self.state.to_steps(speed).round() as i64;
        self.set_speed_sps(sps, false)
    }

    pub fn set_max_speed(&mut self) -> Result<(), Error> {
        self.set_speed_sps(MAX_SPEED_SPS, false)
    }

    pub fn speed(&self) -> f64 {
        self.state.to_units(self.state.speed_sps() as f64)
    }

    fn set_speed_sps(&mut self, sps: i64, force: bool) -> Result<(), Error> {
        if !force && sps == self.state.speed_sps() {
            return Ok(());
        }
        let (vs, vm, at) = self.speed_profile.triple(sps);
        for line in protocol::speed_triple(vs, vm, at) {
            self.command(&line)?;
        }
        self.state.set_speed_sps(sps);
        // The speed triple resets the spindle speed (reverse-engineered,
        // unconfirmed); reassert it afterwards.
        self.reassert_spindle_speed()
    }

    /// Spindle speed on the protocol's normalized 0-99 scale.
    pub fn set_spindle_speed(&mut self, speed: u8) -> Result<(), Error> {
        let speed = speed.min(99);
        if speed == self.state.spindle_speed() {
            return Ok(());
        }
        self.state.set_spindle_speed(speed);
        self.reassert_spindle_speed()
    }

    /// Spindle speed in rpm, clamped to the 1000-5000 range the jog dialog
    /// of the vendor software exposes.
    pub fn set_spindle_rpm(&mut self, rpm: f64) -> Result<(), Error> {
        let rpm = rpm.clamp(MIN_RPM, MAX_RPM);
        let speed = (100.0 * (rpm - MIN_RPM) / (MAX_RPM - MIN_RPM)).round() as u8;
        self.set_spindle_speed(speed.min(99))
    }

    fn reassert_spindle_speed(&mut self) -> Result<(), Error> {
        self.command(&protocol::spindle_speed(self.state.spindle_speed()))
    }

    /// Spindle motor on/off. No-op when already in the requested state.
    pub fn set_spindle(&mut self, on: bool) -> Result<(), Error> {
        if on == self.state.spindle_on() {
            return Ok(());
        }
        self.command(protocol::spindle(on))?;
        self.state.set_spindle_on(on);
        thread::sleep(self.spindle_settle);
        if on {
            // MO1 resets the spindle speed as a side effect
            self.reassert_spindle_speed()?;
        }
        Ok(())
    }

    /// Raise or lower the head. No-op when already in the requested state.
    pub fn set_head_down(&mut self, down: bool) -> Result<(), Error> {
        if down == self.state.head_down() {
            return Ok(());
        }
        let ack = self.transact(&[protocol::head(down).to_string()], SHORT_TIMEOUT)?;
        if ack.delta != (0, 0) {
            warn!("head transition reported a move of {:?} steps", ack.delta);
        }
        self.state.set_head_down(down);
        thread::sleep(self.head_settle);
        Ok(())
    }

    // --- motion ---

    /// Move by a delta in the current unit. Returns the units actually
    /// moved, which can fall short of the request when a limit switch trips
    /// mid-move.
    pub fn move_by(&mut self, dx: f64, dy: f64) -> Result<(f64, f64), Error> {
        let delta = self.state.to_steps_pair((dx, dy));
        let moved = self.move_steps(delta)?;
        Ok(self.state.to_units_pair(moved))
    }

    /// Move to an absolute position relative to the current zero.
    pub fn move_to(&mut self, x: f64, y: f64) -> Result<(f64, f64), Error> {
        let target = self.state.to_steps_pair((x, y));
        let pos = self.state.position();
        let moved = self.move_steps((target.0 - pos.0, target.1 - pos.1))?;
        Ok(self.state.to_units_pair(moved))
    }

    fn move_steps(&mut self, delta: (i64, i64)) -> Result<(i64, i64), Error> {
        self.state.clear_opposing_limits(delta);
        if delta == (0, 0) {
            // DA0,0,0 wedges the firmware; short-circuit instead
            debug!("skipping zero-delta move");
            return Ok((0, 0));
        }
        let ack = self.transact(&protocol::linear_move(delta), MOVE_TIMEOUT)?;
        if let Some((axis, limit)) = ack.limit {
            debug!("{limit:?} limit on {axis:?} truncated the move");
        }
        Ok(ack.delta)
    }

    /// Arc to an absolute endpoint around an absolute center, approximated
    /// by the device's CR primitive. Endpoint and center must be distinct
    /// from each other and from the start point; any of the degenerate
    /// combinations crashes the firmware, so they are rejected here.
    pub fn arc_to(
        &mut self,
        x: f64,
        y: f64,
        center_x: f64,
        center_y: f64,
        clockwise: bool,
    ) -> Result<(f64, f64), Error> {
        let start = self.state.position();
        let end = self.state.to_steps_pair((x, y));
        let center = self.state.to_steps_pair((center_x, center_y));
        if end == start {
            return Err(Error::DegenerateArc("endpoint equals start point"));
        }
        if center == start {
            return Err(Error::DegenerateArc("center equals start point"));
        }
        if center == end {
            return Err(Error::DegenerateArc("center equals endpoint"));
        }
        let delta = (end.0 - start.0, end.1 - start.1);
        self.state.clear_opposing_limits(delta);
        let angle = protocol::arc_angle(
            (start.0 as f64, start.1 as f64),
            (end.0 as f64, end.1 as f64),
            (center.0 as f64, center.1 as f64),
            clockwise,
        );
        let rel_center = (center.0 - start.0, center.1 - start.1);
        let ack = self.transact(&protocol::arc_move(rel_center, delta, angle), MOVE_TIMEOUT)?;
        Ok(self.state.to_units_pair(ack.delta))
    }

    /// Arc by endpoint and center offsets from the current position.
    pub fn arc_by(
        &mut self,
        dx: f64,
        dy: f64,
        center_dx: f64,
        center_dy: f64,
        clockwise: bool,
    ) -> Result<(f64, f64), Error> {
        let (x, y) = self.state.position_units();
        self.arc_to(x + dx, y + dy, x + center_dx, y + center_dy, clockwise)
    }

    // --- jogging ---

    /// Start continuous motion on one axis; the signs of `x`/`y` pick axis
    /// and direction. Must always be paired with [`Controller::stop_jog`].
    pub fn jog(&mut self, x: f64, y: f64, speed: f64) -> Result<(), Error> {
        if x != 0.0 && y != 0.0 {
            return self.misuse("cannot jog two axes at once");
        }
        if x == 0.0 && y == 0.0 {
            return self.misuse("jog needs a direction");
        }
        let (axis, sign) = if x != 0.0 {
            (Axis::X, x.signum() as i64)
        } else {
            (Axis::Y, y.signum() as i64)
        };
        match axis {
            Axis::X => self.state.clear_opposing_limits((sign, 0)),
            Axis::Y => self.state.clear_opposing_limits((0, sign)),
        }
        let sps = self.state.to_steps(speed).round() as i64;
        self.command(&protocol::jog_speed(sps))?;
        self.command(&protocol::jog(axis, sign))?;
        self.jogging = true;
        Ok(())
    }

    /// Halt jogging and reconcile the accumulated travel from the stop
    /// acknowledgement. Returns units moved since the jog started.
    pub fn stop_jog(&mut self) -> Result<(f64, f64), Error> {
        if !self.jogging {
            self.misuse("stop_jog without a preceding jog")?;
            return Ok((0.0, 0.0));
        }
        self.jogging = false;
        // Stop both hardware axes; the idle one acknowledges a zero delta
        let first = self.transact(&[protocol::jog(Axis::Y, 0)], SHORT_TIMEOUT)?;
        let second = self.transact(&[protocol::jog(Axis::X, 0)], SHORT_TIMEOUT)?;
        let moved = (
            first.delta.0 + second.delta.0,
            first.delta.1 + second.delta.1,
        );
        Ok(self.state.to_units_pair(moved))
    }

    // --- homing ---

    /// Find the (-,-) corner and zero the coordinate frame on it.
    pub fn zero(&mut self) -> Result<(), Error> {
        self.find_corner(-1, -1, true)
    }

    /// Re-zero the coordinate frame on the current position without moving.
    pub fn zero_here(&mut self) {
        self.state.zero_here();
    }

    /// Drive to a physical corner picked by the limit signs (`+1`/`-1` per
    /// axis): fast approach until the switch trips, back off, slow
    /// re-approach for an accurate stop. Optionally zeros there. Working
    /// speed/units/spindle configuration is saved and restored around the
    /// search.
    pub fn find_corner(&mut self, lx: i8, ly: i8, zero_there: bool) -> Result<(), Error> {
        let want_x = if lx > 0 { Limit::Positive } else { Limit::Negative };
        let want_y = if ly > 0 { Limit::Positive } else { Limit::Negative };
        self.set_head_down(false)?;
        self.set_spindle(false)?;
        self.save_state();
        let searched = self
            .corner_search(Axis::X, want_x)
            .and_then(|_| self.corner_search(Axis::Y, want_y));
        self.restore_state(false)?;
        searched?;
        if zero_there {
            self.zero_here();
        }
        Ok(())
    }

    fn corner_search(&mut self, axis: Axis, want: Limit) -> Result<(), Error> {
        let sign = want.sign();
        let on_axis = |steps: i64| match axis {
            Axis::X => (steps, 0),
            Axis::Y => (0, steps),
        };

        self.set_speed_sps(SEARCH_FAST_SPS, false)?;
        let mut moves = 0;
        while self.state.limit(axis) != want {
            if moves >= MAX_SEARCH_MOVES {
                return Err(Error::LimitSearch {
                    axis,
                    wanted: want,
                    got: self.state.limit(axis),
                });
            }
            self.move_steps(on_axis(sign * SEARCH_COARSE_STEPS))?;
            moves += 1;
        }

        // Back off half a fine increment, then creep back in slowly so the
        // final stop lands right on the switch
        self.move_steps(on_axis(-sign * SEARCH_FINE_STEPS / 2))?;
        self.set_speed_sps(SEARCH_SLOW_SPS, false)?;
        self.move_steps(on_axis(sign * SEARCH_FINE_STEPS))?;

        if self.state.limit(axis) != want {
            let got = self.state.limit(axis);
            match self.strictness {
                Strictness::Strict => {
                    return Err(Error::LimitSearch {
                        axis,
                        wanted: want,
                        got,
                    });
                }
                Strictness::Lenient => {
                    warn!("failed to find {axis:?} limit {want:?}, got {got:?}");
                }
            }
        }
        Ok(())
    }

    // --- state stack ---

    /// Push a copy of the working configuration (speed, units, spindle,
    /// head, position) for a later [`Controller::restore_state`].
    pub fn save_state(&mut self) {
        self.state.push_snapshot();
    }

    /// Pop the most recent save and reapply it to the device.
    ///
    /// With `move_back` the head physically drives back to the saved
    /// position first; that is only meaningful if no re-zero happened since
    /// the save. Without it, wherever the head ended up is accepted as the
    /// restored position. Restoring with nothing saved is a logged no-op.
    ///
    /// Field order matters here: the speed triple and spindle-on both reset
    /// the spindle speed, so it is reasserted after each of them.
    pub fn restore_state(&mut self, move_back: bool) -> Result<(), Error> {
        let Some(snap) = self.state.pop_snapshot() else {
            warn!("restore_state with nothing saved; ignoring");
            return Ok(());
        };
        self.state.set_units(snap.steps_per_unit);
        if move_back {
            self.set_head_down(false)?;
            self.set_spindle(false)?;
            self.set_max_speed()?;
            let pos = self.state.position();
            self.move_steps((snap.position.0 - pos.0, snap.position.1 - pos.1))?;
        }
        self.set_speed_sps(snap.speed_sps, false)?;
        self.state.set_spindle_speed(snap.spindle_speed);
        self.reassert_spindle_speed()?;
        if snap.spindle_on && !self.state.spindle_on() {
            // Never spin up with the head on the work surface
            self.set_head_down(false)?;
        }
        self.set_spindle(snap.spindle_on)?;
        self.set_head_down(snap.head_down)?;
        self.state.set_units(snap.steps_per_unit);
        Ok(())
    }

    /// Depth of the save stack including the live base state.
    pub fn state_depth(&self) -> usize {
        self.state.depth()
    }

    /// Drive the head toward the operator for a tool change: head up,
    /// spindle off, then 200 mm hops toward the (-,-) corner until a limit
    /// stops them. Saves state first; resume with `restore_state(true)`.
    pub fn tool_change(&mut self) -> Result<(), Error> {
        self.set_head_down(false)?;
        self.set_spindle(false)?;
        self.save_state();
        self.set_max_speed()?;
        for delta in [(-TOOL_CHANGE_HOP_STEPS, 0), (0, -TOOL_CHANGE_HOP_STEPS)] {
            for _ in 0..MAX_TOOL_CHANGE_HOPS {
                let moved = self.move_steps(delta)?;
                if moved != delta {
                    break;
                }
            }
        }
        Ok(())
    }

    // --- protocol plumbing ---

    fn misuse(&mut self, what: &'static str) -> Result<(), Error> {
        match self.strictness {
            Strictness::Strict => Err(Error::JogMisuse(what)),
            Strictness::Lenient => {
                error!("{what}");
                Ok(())
            }
        }
    }

    /// Fire-and-forget command: no acknowledgement expected, brief pause
    /// for the firmware to chew on it.
    fn command(&mut self, line: &str) -> Result<(), Error> {
        self.write_raw(line)?;
        thread::sleep(POLL_SLEEP);
        Ok(())
    }

    fn write_raw(&mut self, line: &str) -> Result<(), Error> {
        let waiting = self.transport.bytes_waiting();
        if waiting > 0 {
            warn!("dumping {waiting} unexpected bytes before write");
            self.transport.discard_waiting();
        }
        debug!("W {line}");
        self.transport.write_line(line)?;
        Ok(())
    }

    /// Send command lines and collect the acknowledgement: read until a
    /// terminal line (OK/ES) has been seen and nothing more is draining in.
    /// Applies acknowledged deltas and limit flags to the machine state; a
    /// device error or emergency stop reinitializes and raises.
    fn transact(&mut self, lines: &[String], timeout: Duration) -> Result<Ack, Error> {
        for line in lines {
            self.write_raw(line)?;
        }

        let mut delta = (0i64, 0i64);
        let mut limit = None;
        let mut fault: Option<Error> = None;
        let mut terminal = false;
        loop {
            let line = if terminal || fault.is_some() {
                // Give the UART one poll interval to drain stragglers
                thread::sleep(POLL_SLEEP);
                if self.transport.bytes_waiting() == 0 {
                    break;
                }
                self.transport.read_line(SHORT_TIMEOUT)?
            } else {
                self.transport.read_line(timeout)?
            };
            debug!("R {line}");
            match protocol::classify(&line) {
                Response::Ok { delta: d } => {
                    delta.0 += d.0;
                    delta.1 += d.1;
                    terminal = true;
                }
                Response::LimitHit {
                    axis,
                    limit: tripped,
                    delta: d,
                } => {
                    delta.0 += d.0;
                    delta.1 += d.1;
                    self.state.set_limit(axis, tripped);
                    limit = Some((axis, tripped));
                }
                Response::EmergencyStop { delta: d } => {
                    delta.0 += d.0;
                    delta.1 += d.1;
                    fault = Some(Error::EmergencyStop);
                    terminal = true;
                }
                Response::Error(code) => {
                    if fault.is_none() {
                        fault = Some(Error::Device(code));
                    }
                }
                Response::Unknown(text) => warn!("ignoring unrecognized response '{text}'"),
            }
        }

        if delta != (0, 0) {
            debug!("moved by {},{} steps", delta.0, delta.1);
            self.state.apply_delta(delta);
        }
        if let Some(err) = fault {
            self.reinit()?;
            return Err(err);
        }
        Ok(Ack { delta, limit })
    }

    /// Recover from an ER/ES response: replay the handshake and reassert
    /// the last known speed, leaving the caller to decide whether the
    /// logical operation should be retried.
    fn reinit(&mut self) -> Result<(), Error> {
        warn!("reinitializing controller after device fault");
        self.transport.discard_waiting();
        self.jogging = false;
        self.handshake(self.state.speed_sps())
    }

    fn drain_responses(&mut self) -> Result<(), Error> {
        loop {
            match self.transport.read_line(SHORT_TIMEOUT) {
                Ok(line) => debug!("R {line}"),
                Err(TransportError::Timeout(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimTransport;

    fn test_profile() -> MachineProfile {
        let _ = env_logger::builder().is_test(true).try_init();
        MachineProfile {
            head_settle_ms: 0,
            spindle_settle_ms: 0,
            ..Default::default()
        }
    }

    /// Sim with the head mid-bed and a controller that has finished its
    /// handshake.
    fn sim_controller() -> (SimTransport, Controller) {
        let sim = SimTransport::with_bounds(100_000, 100_000);
        sim.set_position((50_000, 50_000));
        let controller =
            Controller::with_profile(Box::new(sim.clone()), &test_profile()).unwrap();
        (sim, controller)
    }

    #[test]
    fn handshake_initializes_and_sets_speed() {
        let (sim, _controller) = sim_controller();
        let transcript = sim.transcript();
        assert_eq!(transcript[0], "IM");
        assert_eq!(transcript[1], "EO0");
        assert_eq!(&transcript[2..5], ["VS1000", "VM4000", "AT20"]);
        // Spindle speed is reasserted after every speed triple
        assert_eq!(transcript[5], "SS0");
    }

    #[test]
    fn simple_move_updates_position_from_acknowledgement() {
        let (sim, mut controller) = sim_controller();
        controller.set_units(100.0);
        let before = sim.transcript().len();

        let moved = controller.move_by(10.0, 0.0).unwrap();

        // Logical delta (1000,0) goes out axis-swapped
        let transcript = sim.transcript();
        assert_eq!(&transcript[before..], ["DA0,1000,0", "GO"]);
        assert_eq!(moved, (10.0, 0.0));
        assert_eq!(controller.position(), (10.0, 0.0));
        assert_eq!(controller.state().position(), (1000, 0));
    }

    #[test]
    fn limit_hit_truncates_move_and_sets_flag() {
        let sim = SimTransport::with_bounds(100_000, 100_000);
        // Logical +X is hardware +Y: 400 steps of headroom left
        sim.set_position((50_000, 99_600));
        let mut controller =
            Controller::with_profile(Box::new(sim.clone()), &test_profile()).unwrap();
        controller.set_units(100.0);

        let moved = controller.move_by(10.0, 0.0).unwrap();

        assert_eq!(moved, (4.0, 0.0));
        assert_eq!(controller.limits(), (Limit::Positive, Limit::None));
        assert_eq!(controller.state().position(), (400, 0));
    }

    #[test]
    fn opposing_move_clears_limit_before_evaluation() {
        let sim = SimTransport::with_bounds(100_000, 100_000);
        sim.set_position((50_000, 99_600));
        let mut controller =
            Controller::with_profile(Box::new(sim.clone()), &test_profile()).unwrap();

        controller.move_by(1000.0, 0.0).unwrap();
        assert_eq!(controller.limits().0, Limit::Positive);

        controller.move_by(-100.0, 0.0).unwrap();
        assert_eq!(controller.limits().0, Limit::None);
    }

    #[test]
    fn zero_delta_move_writes_nothing() {
        let (sim, mut controller) = sim_controller();
        let before = sim.transcript().len();
        assert_eq!(controller.move_by(0.0, 0.0).unwrap(), (0.0, 0.0));
        // Sub-step requests round down to zero too
        controller.set_units(1.0);
        assert_eq!(controller.move_by(0.0001, 0.0).unwrap(), (0.0, 0.0));
        assert_eq!(sim.transcript().len(), before);
    }

    #[test]
    fn setting_current_values_skips_the_round_trip() {
        let (sim, mut controller) = sim_controller();
        let before = sim.transcript().len();
        controller.set_head_down(false).unwrap();
        controller.set_spindle(false).unwrap();
        controller.set_speed(4000.0).unwrap(); // steps units, same as handshake
        assert_eq!(sim.transcript().len(), before);
    }

    #[test]
    fn spindle_speed_reasserted_after_speed_change() {
        let (sim, mut controller) = sim_controller();
        controller.set_spindle_speed(50).unwrap();
        let before = sim.transcript().len();

        controller.set_speed(2000.0).unwrap();

        let transcript = sim.transcript();
        assert_eq!(&transcript[before..], ["VS500", "VM2000", "AT20", "SS50"]);
    }

    #[test]
    fn spindle_on_reasserts_spindle_speed() {
        let (sim, mut controller) = sim_controller();
        controller.set_spindle_speed(30).unwrap();
        let before = sim.transcript().len();

        controller.set_spindle(true).unwrap();

        let transcript = sim.transcript();
        assert_eq!(&transcript[before..], ["MO1", "SS30"]);
        assert!(sim.spindle_on());
    }

    #[test]
    fn spindle_rpm_maps_to_normalized_range() {
        let (sim, mut controller) = sim_controller();
        controller.set_spindle_rpm(5000.0).unwrap();
        assert_eq!(controller.state().spindle_speed(), 99);
        controller.set_spindle_rpm(500.0).unwrap(); // clamps to 1000 rpm
        assert_eq!(controller.state().spindle_speed(), 0);
        assert!(sim.transcript().contains(&"SS99".to_string()));
    }

    #[test]
    fn head_transitions_round_trip() {
        let (sim, mut controller) = sim_controller();
        controller.set_head_down(true).unwrap();
        assert!(sim.head_down());
        assert!(controller.state().head_down());
        controller.set_head_down(false).unwrap();
        assert!(!sim.head_down());
    }

    #[test]
    fn stop_jog_without_jog_is_a_lenient_no_op() {
        let (sim, mut controller) = sim_controller();
        let before = sim.transcript().len();
        let pos = controller.state().position();

        assert_eq!(controller.stop_jog().unwrap(), (0.0, 0.0));

        assert_eq!(sim.transcript().len(), before);
        assert_eq!(controller.state().position(), pos);
    }

    #[test]
    fn jog_misuse_raises_under_strict_policy() {
        let sim = SimTransport::with_bounds(100_000, 100_000);
        let profile = MachineProfile {
            strictness: Strictness::Strict,
            ..test_profile()
        };
        let mut controller = Controller::with_profile(Box::new(sim), &profile).unwrap();

        assert!(matches!(
            controller.stop_jog(),
            Err(Error::JogMisuse(_))
        ));
        assert!(matches!(
            controller.jog(1.0, 1.0, 1000.0),
            Err(Error::JogMisuse(_))
        ));
    }

    #[test]
    fn jog_pairs_with_stop_and_reconciles_position() {
        let (sim, mut controller) = sim_controller();
        sim.set_jog_travel(250);
        let before = sim.transcript().len();

        controller.jog(1.0, 0.0, 1000.0).unwrap();
        let moved = controller.stop_jog().unwrap();

        let transcript = sim.transcript();
        assert_eq!(&transcript[before..], ["VJ1000", "JAY+", "JAX0", "JAY0"]);
        assert_eq!(moved, (250.0, 0.0));
        assert_eq!(controller.state().position(), (250, 0));
    }

    #[test]
    fn device_error_reinitializes_and_raises() {
        let (sim, mut controller) = sim_controller();
        sim.arm_device_error();
        let before = sim.transcript().len();

        let result = controller.move_by(100.0, 0.0);

        assert!(matches!(result, Err(Error::Device(_))));
        let replay = &sim.transcript()[before..];
        assert!(replay.contains(&"IM".to_string()));
        assert!(replay.contains(&"EO0".to_string()));
        assert!(replay.contains(&"VM4000".to_string()));
        assert!(!controller.state().head_down());
        assert!(!controller.state().spindle_on());
    }

    #[test]
    fn emergency_stop_reinitializes_and_raises() {
        let (sim, mut controller) = sim_controller();
        sim.arm_emergency_stop();
        assert!(matches!(
            controller.move_by(100.0, 0.0),
            Err(Error::EmergencyStop)
        ));
        assert!(sim.transcript().iter().filter(|l| *l == "IM").count() >= 2);
    }

    #[test]
    fn degenerate_arcs_never_reach_the_wire() {
        let (sim, mut controller) = sim_controller();
        let before = sim.transcript().len();
        assert!(matches!(
            controller.arc_to(0.0, 0.0, 100.0, 0.0, true),
            Err(Error::DegenerateArc(_))
        ));
        assert!(matches!(
            controller.arc_to(100.0, 0.0, 0.0, 0.0, true),
            Err(Error::DegenerateArc(_))
        ));
        assert!(matches!(
            controller.arc_to(100.0, 0.0, 100.0, 0.0, true),
            Err(Error::DegenerateArc(_))
        ));
        assert_eq!(sim.transcript().len(), before);
    }

    #[test]
    fn arc_encodes_center_delta_and_angle() {
        let (sim, mut controller) = sim_controller();
        let before = sim.transcript().len();

        // Half circle: center 1000 steps up, endpoint 2000 steps up
        controller.arc_to(0.0, 2000.0, 0.0, 1000.0, true).unwrap();

        let transcript = sim.transcript();
        let angle = (std::f64::consts::PI * protocol::ANGLE_SCALE).round() as i64;
        assert_eq!(
            &transcript[before..],
            [format!("CR1000,0,0,2000,0,0,{angle}"), "GO".to_string()]
        );
        assert_eq!(controller.state().position(), (0, 2000));
    }

    #[test]
    fn save_restore_balances_and_reapplies() {
        let (sim, mut controller) = sim_controller();
        controller.set_units_mm();
        controller.set_speed(10.0).unwrap();
        controller.set_spindle_speed(42).unwrap();
        assert_eq!(controller.state_depth(), 1);

        controller.save_state();
        assert_eq!(controller.state_depth(), 2);
        controller.set_units_steps();
        controller.set_speed(400.0).unwrap();
        controller.set_spindle_speed(10).unwrap();

        controller.restore_state(false).unwrap();
        assert_eq!(controller.state_depth(), 1);
        assert_eq!(controller.state().steps_per_unit(), protocol::STEPS_PER_MM);
        assert_eq!(
            controller.state().speed_sps(),
            (10.0 * protocol::STEPS_PER_MM).round() as i64
        );
        assert_eq!(controller.state().spindle_speed(), 42);
        // SS42 went out again after the restored speed triple
        assert_eq!(sim.transcript().last().unwrap(), "SS42");

        // Base state is never popped
        controller.restore_state(false).unwrap();
        assert_eq!(controller.state_depth(), 1);
    }

    #[test]
    fn restore_with_move_back_returns_to_saved_position() {
        let (sim, mut controller) = sim_controller();
        controller.move_by(1000.0, 500.0).unwrap();
        let saved_hw = sim.position();
        controller.save_state();

        controller.move_by(-3000.0, 2000.0).unwrap();
        controller.restore_state(true).unwrap();

        assert_eq!(sim.position(), saved_hw);
        assert_eq!(controller.state().position(), (1000, 500));
    }

    #[test]
    fn find_corner_zeros_at_the_negative_corner() {
        let sim = SimTransport::with_bounds(30_000, 30_000);
        sim.set_position((15_000, 15_000));
        let mut controller =
            Controller::with_profile(Box::new(sim.clone()), &test_profile()).unwrap();
        controller.set_units_mm();
        controller.set_speed(20.0).unwrap();
        let working_sps = controller.state().speed_sps();

        controller.find_corner(-1, -1, true).unwrap();

        assert_eq!(sim.position(), (0, 0));
        assert_eq!(controller.position(), (0.0, 0.0));
        assert_eq!(controller.limits(), (Limit::Negative, Limit::Negative));
        // Working speed and units came back from the save stack
        assert_eq!(controller.state().speed_sps(), working_sps);
        assert_eq!(controller.state().steps_per_unit(), protocol::STEPS_PER_MM);
        assert_eq!(controller.state_depth(), 1);
    }

    #[test]
    fn tool_change_drives_to_the_near_corner() {
        let sim = SimTransport::with_bounds(30_000, 30_000);
        sim.set_position((15_000, 15_000));
        let mut controller =
            Controller::with_profile(Box::new(sim.clone()), &test_profile()).unwrap();

        controller.tool_change().unwrap();
        assert_eq!(sim.position(), (0, 0));
        assert_eq!(controller.state_depth(), 2);

        controller.restore_state(true).unwrap();
        assert_eq!(sim.position(), (15_000, 15_000));
        assert_eq!(controller.state_depth(), 1);
    }
}
