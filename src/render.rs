use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use crate::command::Command;
use crate::controller::Controller;
use crate::error::Error;
use crate::state::Limit;

/// Dry-run overrides for an engraving pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngraveOptions {
    /// Keep the head up no matter what Z says.
    pub head_always_up: bool,
    /// Keep the spindle motor off (check no tool is installed).
    pub spindle_off: bool,
}

/// Drives a controller from a [`Command`] sequence.
///
/// The pass starts from wherever the operator positioned the head: the
/// current position becomes the design origin and units switch to mm. An
/// in-flight device command cannot be cancelled, so the abort flag is only
/// checked between commands; on abort the head comes up and the spindle
/// stops before the error is raised.
pub struct Engraver {
    controller: Controller,
    options: EngraveOptions,
    abort: Arc<AtomicBool>,
}

impl Engraver {
    pub fn new(controller: Controller, options: EngraveOptions) -> Self {
        Self {
            controller,
            options,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the pass after the current command completes.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn into_controller(self) -> Controller {
        self.controller
    }

    /// Zero on the current position, run every command, then finish with
    /// head up, spindle off and a return to the origin.
    pub fn run(&mut self, commands: &[Command]) -> Result<(), Error> {
        self.begin();
        for (index, command) in commands.iter().enumerate() {
            debug!("command {}/{}", index + 1, commands.len());
            self.execute(command)?;
        }
        self.finish()
    }

    /// Make the current head position the design origin.
    pub fn begin(&mut self) {
        self.controller.zero_here();
        self.controller.set_units_mm();
    }

    /// Run one command, honoring the abort flag and dry-run overrides.
    pub fn execute(&mut self, command: &Command) -> Result<(), Error> {
        if self.abort.load(Ordering::Relaxed) {
            info!("engraving pass aborted; stopping cleanly");
            self.clean_stop();
            return Err(Error::Aborted);
        }
        match command {
            Command::Comment(text) => {
                if !text.is_empty() {
                    info!("{text}");
                }
                Ok(())
            }
            Command::LinearMove { x, y, z, feed } => {
                if let Some(feed) = feed {
                    // Feed rates come in units/minute
                    self.controller.set_speed(feed / 60.0)?;
                }
                if let Some(z) = z {
                    self.controller
                        .set_head_down(*z <= 0.0 && !self.options.head_always_up)?;
                }
                if x.is_some() || y.is_some() {
                    let at = self.controller.position();
                    let target = (x.unwrap_or(at.0), y.unwrap_or(at.1));
                    self.guarded_move(|c| c.move_to(target.0, target.1))?;
                }
                Ok(())
            }
            Command::ArcMove {
                x,
                y,
                center_x,
                center_y,
                clockwise,
                feed,
            } => {
                if let Some(feed) = feed {
                    self.controller.set_speed(feed / 60.0)?;
                }
                let result =
                    self.guarded_move(|c| c.arc_to(*x, *y, *center_x, *center_y, *clockwise));
                match result {
                    Err(Error::DegenerateArc(why)) => {
                        // Never worth killing a whole pass over; the
                        // endpoint of a degenerate arc is the start point
                        warn!("skipping degenerate arc ({why})");
                        Ok(())
                    }
                    other => other.map(|_| ()),
                }
            }
            Command::SpindleOn => self.controller.set_spindle(!self.options.spindle_off),
            Command::SpindleOff => self.controller.set_spindle(false),
        }
    }

    /// End-of-program: head up, spindle off, fly home.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.controller.set_head_down(false)?;
        self.controller.set_spindle(false)?;
        self.controller.set_max_speed()?;
        self.controller.move_to(0.0, 0.0)?;
        Ok(())
    }

    /// A limit switch tripping mid-design means the design does not fit the
    /// bed from this origin (or steps were skipped); either way the pass
    /// cannot be trusted past this point.
    fn guarded_move<F>(&mut self, movement: F) -> Result<(f64, f64), Error>
    where
        F: FnOnce(&mut Controller) -> Result<(f64, f64), Error>,
    {
        let before = self.controller.limits();
        let moved = movement(&mut self.controller)?;
        let after = self.controller.limits();
        if after.0 != before.0 && after.0 != Limit::None {
            self.clean_stop();
            return Err(Error::UnexpectedLimit {
                axis: crate::state::Axis::X,
                limit: after.0,
            });
        }
        if after.1 != before.1 && after.1 != Limit::None {
            self.clean_stop();
            return Err(Error::UnexpectedLimit {
                axis: crate::state::Axis::Y,
                limit: after.1,
            });
        }
        Ok(moved)
    }

    /// Best-effort safe halt; failures are logged, not raised, because this
    /// runs on the way out of an already-failing pass.
    fn clean_stop(&mut self) {
        if let Err(e) = self.controller.set_head_down(false) {
            warn!("clean stop: failed to raise head: {e}");
        }
        if let Err(e) = self.controller.set_spindle(false) {
            warn!("clean stop: failed to stop spindle: {e}");
        }
    }
}
