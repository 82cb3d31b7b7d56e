use std::collections::HashMap;

use log::warn;

/// One entry of the abstract command stream an external g-code layer
/// produces: a name (`G1`, `M3`, `comment`, ...), argument letters mapped to
/// numeric values, and the source line for diagnostics.
#[derive(Debug, Clone)]
pub struct RawCommand {
    pub name: String,
    pub args: HashMap<char, f64>,
    /// Free text payload for comment/message entries.
    pub text: Option<String>,
    pub line: u32,
}

impl RawCommand {
    pub fn new(name: &str, args: &[(char, f64)], line: u32) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().copied().collect(),
            text: None,
            line,
        }
    }

    pub fn message(text: &str, line: u32) -> Self {
        Self {
            name: "message".to_string(),
            args: HashMap::new(),
            text: Some(text.to_string()),
            line,
        }
    }
}

/// The command vocabulary the renderer drives the controller with.
///
/// Coordinates are absolute in the current unit; arc centers are absolute as
/// well (I/J offsets are resolved against the position the raw command was
/// mapped at).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Comment(String),
    LinearMove {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        feed: Option<f64>,
    },
    ArcMove {
        x: f64,
        y: f64,
        center_x: f64,
        center_y: f64,
        clockwise: bool,
        feed: Option<f64>,
    },
    SpindleOn,
    SpindleOff,
}

impl Command {
    /// Map a raw command to the typed vocabulary. `at` is the position the
    /// stream has reached, used to resolve arc centers and missing arc
    /// endpoints. Returns `None` for anything outside the vocabulary; the
    /// caller decides whether to log or skip.
    pub fn from_raw(raw: &RawCommand, at: (f64, f64)) -> Option<Command> {
        match raw.name.as_str() {
            "comment" | "message" => {
                Some(Command::Comment(raw.text.clone().unwrap_or_default()))
            }
            "G0" | "G00" | "G1" | "G01" => Some(Command::LinearMove {
                x: raw.args.get(&'X').copied(),
                y: raw.args.get(&'Y').copied(),
                z: raw.args.get(&'Z').copied(),
                feed: raw.args.get(&'F').copied(),
            }),
            "G2" | "G02" | "G3" | "G03" => {
                let clockwise = raw.name.starts_with("G2") || raw.name == "G02";
                let i = raw.args.get(&'I').copied();
                let j = raw.args.get(&'J').copied();
                let (Some(i), Some(j)) = (i, j) else {
                    warn!("arc without I/J center on line {}; skipping", raw.line);
                    return None;
                };
                Some(Command::ArcMove {
                    x: raw.args.get(&'X').copied().unwrap_or(at.0),
                    y: raw.args.get(&'Y').copied().unwrap_or(at.1),
                    center_x: at.0 + i,
                    center_y: at.1 + j,
                    clockwise,
                    feed: raw.args.get(&'F').copied(),
                })
            }
            "M3" | "M03" | "M4" | "M04" => Some(Command::SpindleOn),
            "M5" | "M05" => Some(Command::SpindleOff),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_move_carries_optional_fields() {
        let raw = RawCommand::new("G1", &[('X', 5.0), ('F', 600.0)], 12);
        assert_eq!(
            Command::from_raw(&raw, (0.0, 0.0)),
            Some(Command::LinearMove {
                x: Some(5.0),
                y: None,
                z: None,
                feed: Some(600.0),
            })
        );
    }

    #[test]
    fn arc_center_resolves_relative_offsets() {
        let raw = RawCommand::new("G2", &[('X', 10.0), ('Y', 0.0), ('I', 5.0), ('J', 0.0)], 3);
        assert_eq!(
            Command::from_raw(&raw, (2.0, 1.0)),
            Some(Command::ArcMove {
                x: 10.0,
                y: 0.0,
                center_x: 7.0,
                center_y: 1.0,
                clockwise: true,
                feed: None,
            })
        );
    }

    #[test]
    fn ccw_arc_and_spindle_codes_map() {
        let arc = RawCommand::new("G3", &[('X', 0.0), ('I', 1.0), ('J', 1.0)], 1);
        match Command::from_raw(&arc, (0.0, 0.0)) {
            Some(Command::ArcMove { clockwise, y, .. }) => {
                assert!(!clockwise);
                assert_eq!(y, 0.0); // missing Y defaults to current
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
        assert_eq!(
            Command::from_raw(&RawCommand::new("M3", &[], 2), (0.0, 0.0)),
            Some(Command::SpindleOn)
        );
        assert_eq!(
            Command::from_raw(&RawCommand::new("M5", &[], 3), (0.0, 0.0)),
            Some(Command::SpindleOff)
        );
    }

    #[test]
    fn arc_without_center_and_unknown_names_are_skipped() {
        let arc = RawCommand::new("G2", &[('X', 1.0)], 7);
        assert_eq!(Command::from_raw(&arc, (0.0, 0.0)), None);
        let unknown = RawCommand::new("G64", &[], 8);
        assert_eq!(Command::from_raw(&unknown, (0.0, 0.0)), None);
    }
}
