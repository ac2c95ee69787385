//! Depth profiles selected at graph-construction time.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Which optional phases and gates a run includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Elides `deep_only` phases and skips more gates.
    Shallow,
    /// Everything included.
    Deep,
    /// Everything included.
    #[default]
    Full,
    /// Starts like `Shallow` and may extend the graph mid-run.
    Auto,
}

impl Profile {
    pub const ALL: [Profile; 4] = [Profile::Shallow, Profile::Deep, Profile::Full, Profile::Auto];

    /// Whether phases marked `deep_only` are part of the graph.
    pub fn includes_deep_phases(self) -> bool {
        matches!(self, Profile::Deep | Profile::Full)
    }

    /// Whether the extension policy may splice new work into a running graph.
    pub fn extends_dynamically(self) -> bool {
        self == Profile::Auto
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Shallow => "shallow",
            Profile::Deep => "deep",
            Profile::Full => "full",
            Profile::Auto => "auto",
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Profile::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                Error::Validation(format!(
                    "unknown profile '{}' (expected shallow, deep, full or auto)",
                    s
                ))
            })
    }
}
