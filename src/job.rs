use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, unbounded};
use log::error;

use crate::command::Command;
use crate::controller::Controller;
use crate::render::{EngraveOptions, Engraver};

/// Progress reports from a background engraving pass.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMsg {
    Started { total: usize },
    Progress { index: usize, total: usize, position: (f64, f64) },
    Finished,
    Failed(String),
}

/// An engraving pass running on its own thread.
///
/// The controller moves into the worker for the duration of the job and
/// comes back from [`EngraveJob::join`]. Progress arrives on a channel so a
/// UI (or a test) can poll without blocking the pass.
pub struct EngraveJob {
    rx: Receiver<JobMsg>,
    abort: Arc<AtomicBool>,
    handle: JoinHandle<Controller>,
}

impl EngraveJob {
    pub fn spawn(
        controller: Controller,
        options: EngraveOptions,
        commands: Vec<Command>,
    ) -> EngraveJob {
        let (tx, rx) = unbounded();
        let mut engraver = Engraver::new(controller, options);
        let abort = engraver.abort_handle();
        let handle = thread::spawn(move || {
            let total = commands.len();
            let _ = tx.send(JobMsg::Started { total });
            engraver.begin();
            for (index, command) in commands.iter().enumerate() {
                if let Err(e) = engraver.execute(command) {
                    error!("engraving failed at command {}: {e}", index + 1);
                    let _ = tx.send(JobMsg::Failed(e.to_string()));
                    return engraver.into_controller();
                }
                let _ = tx.send(JobMsg::Progress {
                    index: index + 1,
                    total,
                    position: engraver.controller().position(),
                });
            }
            let msg = match engraver.finish() {
                Ok(()) => JobMsg::Finished,
                Err(e) => {
                    error!("engraving cleanup failed: {e}");
                    JobMsg::Failed(e.to_string())
                }
            };
            let _ = tx.send(msg);
            engraver.into_controller()
        });
        EngraveJob { rx, abort, handle }
    }

    /// Progress channel; disconnects when the worker exits.
    pub fn messages(&self) -> &Receiver<JobMsg> {
        &self.rx
    }

    /// Ask the worker to stop after the command in flight.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Wait for the pass to end and take the controller back.
    pub fn join(self) -> Controller {
        match self.handle.join() {
            Ok(controller) => controller,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
