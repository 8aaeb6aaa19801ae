//! Orchestrator operating modes and the table of legal transitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level operating state of the scan orchestrator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// No map, head parked where it was last left.
    #[default]
    Idle,
    /// Walking a user-requested raster map.
    Mapping,
    /// Dwelling on a chosen point.
    OnTarget,
    /// Walking a small corrective map around the current point.
    Optimising,
    /// Dwelling on a point while a correlation histogram accumulates.
    Hbt,
}

/// Events that drive the mode machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// `scan(map)`
    Scan,
    /// `choose_point(p)` with auto-optimisation on.
    ChoosePointOptimised,
    /// `choose_point(p)` with auto-optimisation off.
    ChoosePoint,
    /// Auto-optimisation timer expiry or an explicit `optimise()`.
    Optimise,
    /// The active map ran out of cells.
    MapComplete,
    /// `setup_hbt(..)`
    SetupHbt,
    /// `stop_hbt()`
    StopHbt,
    /// `stop()`
    Stop,
}

impl Trigger {
    /// Command name used in error messages.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::ChoosePointOptimised | Self::ChoosePoint => "choose_point",
            Self::Optimise => "optimise",
            Self::MapComplete => "map_complete",
            Self::SetupHbt => "setup_hbt",
            Self::StopHbt => "stop_hbt",
            Self::Stop => "stop",
        }
    }
}

impl Mode {
    /// True while the orchestrator owns an active raster map.
    pub fn holds_map(&self) -> bool {
        matches!(self, Mode::Mapping | Mode::Optimising)
    }

    /// True when the head is dwelling on a point.
    pub fn is_dwelling(&self) -> bool {
        matches!(self, Mode::OnTarget | Mode::Hbt)
    }

    /// Next mode for `trigger`, or `None` if the trigger is not defined in
    /// this mode. `previous` is the mode held before the current excursion and
    /// decides where a finished corrective map returns to.
    pub fn next(self, trigger: Trigger, previous: Mode) -> Option<Mode> {
        use Mode::*;
        match (self, trigger) {
            (_, Trigger::Stop) => Some(Idle),
            (Idle, Trigger::Scan) => Some(Mapping),
            (Idle | OnTarget | Hbt, Trigger::ChoosePointOptimised) => Some(Optimising),
            (Idle | OnTarget | Hbt, Trigger::ChoosePoint) => Some(OnTarget),
            (OnTarget | Hbt, Trigger::Optimise) => Some(Optimising),
            (Mapping, Trigger::MapComplete) => Some(Idle),
            (Optimising, Trigger::MapComplete) => Some(if previous == Hbt { Hbt } else { OnTarget }),
            (OnTarget | Hbt, Trigger::SetupHbt) => Some(Hbt),
            (Hbt, Trigger::StopHbt) => Some(OnTarget),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Idle => "idle",
            Mode::Mapping => "mapping",
            Mode::OnTarget => "on_target",
            Mode::Optimising => "optimising",
            Mode::Hbt => "hbt",
        };
        f.write_str(s)
    }
}
