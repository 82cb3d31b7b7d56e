use crate::state::{Axis, Limit};
use crate::transport::TransportError;

/// Everything that can go wrong while driving the engraver.
///
/// Transport faults are never retried automatically: a silently repeated
/// motion command could double-move the head. Device errors and emergency
/// stops arrive *after* the controller has already reinitialized itself, so
/// the caller may retry the logical operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The firmware answered `ER...`. The controller has replayed the
    /// handshake and reasserted speed before raising this.
    #[error("controller reported an error: {0}")]
    Device(String),

    /// The operator hit the emergency stop. Reinitialized, same as
    /// [`Error::Device`], but semantically operator intervention rather than
    /// a firmware fault.
    #[error("emergency stop triggered")]
    EmergencyStop,

    /// Arc parameters the firmware cannot survive; never transmitted.
    #[error("degenerate arc rejected: {0}")]
    DegenerateArc(&'static str),

    /// Jog protocol misuse, raised only under [`Strictness::Strict`].
    ///
    /// [`Strictness::Strict`]: crate::config::Strictness::Strict
    #[error("jog misuse: {0}")]
    JogMisuse(&'static str),

    /// A corner search finished without the expected limit flag.
    #[error("limit search on {axis:?} wanted {wanted:?}, got {got:?}")]
    LimitSearch {
        axis: Axis,
        wanted: Limit,
        got: Limit,
    },

    /// A limit switch tripped during an engraving pass, outside of homing.
    #[error("unexpected {limit:?} limit hit on {axis:?} during engraving")]
    UnexpectedLimit { axis: Axis, limit: Limit },

    /// The engraving pass was aborted between commands.
    #[error("engraving pass aborted")]
    Aborted,
}
