//! Command priority levels.

use std::fmt;
use std::str::FromStr;

/// Client-assigned command priority, ordered from least to most important.
///
/// The discriminant doubles as the queue bucket index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Lowest = 0,
    Lower = 1,
    #[default]
    Normal = 2,
    Higher = 3,
    Highest = 4,
}

impl Priority {
    /// Number of distinct levels.
    pub const COUNT: usize = 5;

    /// All levels, lowest first.
    pub const ALL: [Priority; Priority::COUNT] = [
        Priority::Lowest,
        Priority::Lower,
        Priority::Normal,
        Priority::Higher,
        Priority::Highest,
    ];

    /// Bucket index for this level.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`Priority::index`].
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Maps a Kinetic numeric priority (1, 3, 5, 7, 9) to a level.
    ///
    /// Values between the defined points round down; anything outside
    /// the range clamps to the nearest end.
    pub fn from_wire(value: i64) -> Self {
        match value {
            i64::MIN..=2 => Priority::Lowest,
            3..=4 => Priority::Lower,
            5..=6 => Priority::Normal,
            7..=8 => Priority::Higher,
            _ => Priority::Highest,
        }
    }

    /// The Kinetic numeric value for this level.
    pub fn wire_value(self) -> i64 {
        (self.index() as i64) * 2 + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Lowest => "lowest",
            Priority::Lower => "lower",
            Priority::Normal => "normal",
            Priority::Higher => "higher",
            Priority::Highest => "highest",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    /// Accepts a level name (case insensitive) or a Kinetic numeric value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<i64>() {
            return Ok(Priority::from_wire(n));
        }
        match s.to_ascii_lowercase().as_str() {
            "lowest" => Ok(Priority::Lowest),
            "lower" => Ok(Priority::Lower),
            "normal" => Ok(Priority::Normal),
            "higher" => Ok(Priority::Higher),
            "highest" => Ok(Priority::Highest),
            _ => Err(format!(
                "unknown priority '{s}'. valid options: lowest, lower, normal, higher, highest"
            )),
        }
    }
}
