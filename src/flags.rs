use std::fmt;

use serde::Deserialize;

/// SHARK quality flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum Flag {
    /// No QC was performed.
    #[default]
    #[serde(rename = "0")]
    NotEvaluated,
    /// Accepted value.
    #[serde(rename = "A")]
    Accepted,
    /// Bad value.
    #[serde(rename = "B")]
    Bad,
    /// Suspicious value.
    #[serde(rename = "S")]
    Suspicious,
    /// Suspect extreme value that has been checked and is OK (not set by routines).
    #[serde(rename = "E")]
    Extreme,
    /// Below the limit of quantification (not set by routines).
    #[serde(rename = "<")]
    BelowLimit,
}

impl Flag {
    pub fn as_char(self) -> char {
        match self {
            Flag::NotEvaluated => '0',
            Flag::Accepted => 'A',
            Flag::Bad => 'B',
            Flag::Suspicious => 'S',
            Flag::Extreme => 'E',
            Flag::BelowLimit => '<',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Flag::NotEvaluated),
            'A' => Some(Flag::Accepted),
            'B' => Some(Flag::Bad),
            'S' => Some(Flag::Suspicious),
            'E' => Some(Flag::Extreme),
            '<' => Some(Flag::BelowLimit),
            _ => None,
        }
    }

    /// Merge a new verdict into an existing slot. Never downgrades.
    pub fn escalate(self, new: Flag) -> Flag {
        match (self, new) {
            (Flag::NotEvaluated | Flag::Accepted, n) => n,
            (Flag::Suspicious, Flag::Bad) => Flag::Bad,
            (e, Flag::Suspicious) if e != Flag::Bad => Flag::Suspicious,
            (e, _) => e,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Automatic flag history of one parameter at one row: one slot per routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagString(Vec<Flag>);

impl FlagString {
    pub fn new(routine_count: usize) -> Self {
        Self(vec![Flag::NotEvaluated; routine_count])
    }

    /// Parse a stored flag string. `None` when the length or alphabet is wrong.
    pub fn parse(raw: &str, routine_count: usize) -> Option<Self> {
        let flags = raw.chars().map(Flag::from_char).collect::<Option<Vec<_>>>()?;
        (flags.len() == routine_count).then_some(Self(flags))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Flag> {
        self.0.get(index).copied()
    }

    /// Escalate the slot at `index`. Out-of-range indices are ignored.
    pub fn escalate(&mut self, index: usize, flag: Flag) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = slot.escalate(flag);
        }
    }

    pub fn contains(&self, flag: Flag) -> bool {
        self.0.contains(&flag)
    }
}

impl fmt::Display for FlagString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for flag in &self.0 {
            write!(f, "{flag}")?;
        }
        Ok(())
    }
}

/// Primary flag for a row given its automatic flag string, or `None` to keep
/// the existing primary flag. `B` wins over `S`.
pub fn primary_from_auto(raw: &str) -> Option<Flag> {
    let mut primary = None;
    for flag in [Flag::Suspicious, Flag::Bad] {
        if raw.contains(flag.as_char()) {
            primary = Some(flag);
        }
    }
    primary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(start: Flag, verdicts: &[Flag]) -> Flag {
        verdicts.iter().fold(start, |e, n| e.escalate(*n))
    }

    #[test]
    fn test_escalation_never_downgrades() {
        use Flag::*;
        assert_eq!(apply(NotEvaluated, &[Accepted, Suspicious, Accepted]), Suspicious);
        assert_eq!(apply(NotEvaluated, &[Suspicious, Bad]), Bad);
        assert_eq!(apply(NotEvaluated, &[Bad, Suspicious]), Bad);
        assert_eq!(apply(NotEvaluated, &[Bad, Accepted]), Bad);
        assert_eq!(apply(Accepted, &[Bad]), Bad);
    }

    #[test]
    fn test_flag_string_roundtrip_and_validation() {
        let fs = FlagString::parse("A0BS", 4).unwrap();
        assert_eq!(fs.to_string(), "A0BS");
        assert!(FlagString::parse("A0B", 4).is_none());
        assert!(FlagString::parse("A0BX", 4).is_none());
        assert_eq!(FlagString::new(3).to_string(), "000");
    }

    #[test]
    fn test_flag_string_escalate_slot() {
        let mut fs = FlagString::new(3);
        fs.escalate(1, Flag::Accepted);
        fs.escalate(1, Flag::Suspicious);
        fs.escalate(2, Flag::Bad);
        fs.escalate(7, Flag::Bad);
        assert_eq!(fs.to_string(), "0SB");
        assert!(fs.contains(Flag::Bad));
    }

    #[test]
    fn test_primary_from_auto() {
        assert_eq!(primary_from_auto("A00BA"), Some(Flag::Bad));
        assert_eq!(primary_from_auto("A00AS"), Some(Flag::Suspicious));
        assert_eq!(primary_from_auto("A0SBA"), Some(Flag::Bad));
        assert_eq!(primary_from_auto("A00AA"), None);
    }
}
