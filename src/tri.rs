use std::fmt;

/// The ordered lattice used for boolish symbol values: `No < Mod < Yes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tristate {
    No = 0,
    Mod = 1,
    Yes = 2,
}

impl Tristate {
    pub fn and(self, other: Tristate) -> Tristate {
        self.min(other)
    }

    pub fn or(self, other: Tristate) -> Tristate {
        self.max(other)
    }

    pub fn not(self) -> Tristate {
        match self {
            Tristate::No => Tristate::Yes,
            Tristate::Mod => Tristate::Mod,
            Tristate::Yes => Tristate::No,
        }
    }

    /// Strict parse of the canonical `n`/`m`/`y` encoding.
    pub fn parse(s: &str) -> Option<Tristate> {
        match s {
            "n" => Some(Tristate::No),
            "m" => Some(Tristate::Mod),
            "y" => Some(Tristate::Yes),
            _ => None,
        }
    }

    /// Lenient conversion used when a non-boolish value participates in a
    /// tri-valued comparison. Anything that is not a tristate encoding
    /// collapses to `No`.
    pub fn from_value(s: &str) -> Tristate {
        Tristate::parse(s).unwrap_or(Tristate::No)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tristate::No => "n",
            Tristate::Mod => "m",
            Tristate::Yes => "y",
        }
    }
}

impl fmt::Display for Tristate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
