//! Driver for the AMC2500 CNC engraving machine.
//!
//! The AMC2500 control unit speaks an undocumented ASCII line protocol over
//! RS-232; this crate implements that protocol as reverse-engineered from
//! wire captures, and layers a stateful controller on top of it.
//!
//! * [`transport`] — serial port I/O behind a [`Transport`] trait, plus a
//!   scriptable simulator for tests.
//! * [`protocol`] — command encoding and response classification, including
//!   the axis swap between the device's frame and the operator's.
//! * [`controller`] — the synchronous [`Controller`]: moves, arcs, jogging,
//!   head and spindle control, corner finding, state save/restore.
//! * [`command`] / [`render`] / [`job`] — a small toolpath command model,
//!   the [`Engraver`] that executes it, and a background worker wrapper.
//!
//! Positions are tracked purely from device acknowledgements, so the
//! controller stays honest even when a limit switch truncates a move.

pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod protocol;
pub mod render;
pub mod state;
pub mod transport;

pub use command::{Command, RawCommand};
pub use config::{MachineProfile, SpeedProfile, Strictness};
pub use controller::{Controller, connect};
pub use error::Error;
pub use job::{EngraveJob, JobMsg};
pub use render::{EngraveOptions, Engraver};
pub use state::{Axis, Limit, MachineState};
pub use transport::{SerialTransport, SimTransport, Transport, TransportError, list_ports};
