//! Phase numbering.
//!
//! Each actor declares a list of phases. Every entry is either implicit
//! (takes the next number) or carries an explicit inclusive `Phase` range.
//! [`expand_phases`] turns that list into a map keyed by the phase numbers
//! the actor actually takes part in.

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigNode;
use crate::core::errors::{LoadcastError, Result};
use crate::orchestrator::Orchestrator;

pub type PhaseNumber = u32;

/// Widest range a single `Phase` entry may declare.
pub const MAX_PHASE_RANGE: PhaseNumber = 10_000;

/// Inclusive range of phase numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRangeSpec {
    pub start: PhaseNumber,
    pub end: PhaseNumber,
}

impl PhaseRangeSpec {
    pub fn new(start: PhaseNumber, end: PhaseNumber) -> Result<Self> {
        if start > end {
            return Err(LoadcastError::configuration(format!(
                "Phase range {}..{} ends before it starts",
                start, end
            )));
        }
        if end - start >= MAX_PHASE_RANGE {
            return Err(LoadcastError::configuration(format!(
                "Phase range {}..{} spans more than {} phases",
                start, end, MAX_PHASE_RANGE
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(phase: PhaseNumber) -> Self {
        Self {
            start: phase,
            end: phase,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PhaseNumber> {
        self.start..=self.end
    }

    /// Reads a `Phase` key: `3`, `"2..4"` or `[2, 4]`.
    pub fn from_node(node: &ConfigNode) -> Result<Option<Self>> {
        let bad = |detail: &str| {
            LoadcastError::configuration_field(
                format!("Invalid phase range at '{}': {}", node.path(), detail),
                node.path().to_string(),
            )
        };

        match node.value() {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(_)) => Ok(Some(Self::single(node.to::<PhaseNumber>()?))),
            Some(Value::String(s)) => s
                .parse::<PhaseRangeSpec>()
                .map(Some)
                .map_err(|e| bad(&e.to_string())),
            Some(Value::Sequence(seq)) if seq.len() == 2 => {
                let bounds: Vec<PhaseNumber> = node.to()?;
                Self::new(bounds[0], bounds[1]).map(Some)
            }
            Some(_) => Err(bad("expected an integer, 'start..end' or [start, end]")),
        }
    }
}

impl FromStr for PhaseRangeSpec {
    type Err = LoadcastError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.trim().parse::<PhaseNumber>().map_err(|e| {
                LoadcastError::configuration(format!("Bad phase number '{}': {}", part.trim(), e))
            })
        };

        match s.split_once("..") {
            Some((start, end)) => Self::new(parse(start)?, parse(end)?),
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

impl fmt::Display for PhaseRangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// One phase of one actor.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    phase: PhaseNumber,
    node: ConfigNode,
    nop: bool,
}

impl PhaseContext {
    pub fn new(phase: PhaseNumber, node: ConfigNode) -> Result<Self> {
        let nop = node.get("Nop").maybe::<bool>()?.unwrap_or(false);
        Ok(Self { phase, node, nop })
    }

    pub fn phase(&self) -> PhaseNumber {
        self.phase
    }

    /// A nop phase does no work and is left out of reporting.
    pub fn is_nop(&self) -> bool {
        self.nop
    }

    /// The phase's own configuration block.
    pub fn node(&self) -> &ConfigNode {
        &self.node
    }

    pub fn get(&self, key: &str) -> ConfigNode {
        self.node.get(key)
    }
}

/// Expands an actor's `Phases` list.
///
/// The implicit-phase counter starts at 0 and advances by one per inserted
/// phase number, so an entry after `[5, 6]` continues from the count of
/// phases seen so far rather than from 7.
pub fn expand_phases(
    phases: &ConfigNode,
    orchestrator: &Orchestrator,
) -> Result<BTreeMap<PhaseNumber, PhaseContext>> {
    let mut out = BTreeMap::new();
    if !phases.exists() || phases.is_null() {
        return Ok(out);
    }
    if !matches!(phases.value(), Some(Value::Sequence(_)) | Some(Value::Mapping(_))) {
        return Err(LoadcastError::configuration_field(
            format!("'{}' must be a list of phases", phases.path()),
            phases.path().to_string(),
        ));
    }

    let mut next_phase: PhaseNumber = 0;
    for (_, phase) in phases.entries() {
        if phase.is_null() {
            return Err(LoadcastError::configuration_field(
                format!(
                    "Encountered a null/empty phase at '{}'. \
                     Every phase should at least be an empty map.",
                    phase.path()
                ),
                phase.path().to_string(),
            ));
        }

        let range = PhaseRangeSpec::from_node(&phase.get("Phase"))?
            .unwrap_or_else(|| PhaseRangeSpec::single(next_phase));

        for number in range.iter() {
            if out.contains_key(&number) {
                return Err(LoadcastError::configuration_field(
                    format!("Duplicate phase {}", number),
                    phase.path().to_string(),
                ));
            }
            out.insert(number, PhaseContext::new(number, phase.clone())?);
            next_phase += 1;
        }
    }

    if let Some(&highest) = out.keys().next_back() {
        orchestrator.phases_at_least_to(highest);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn expand(yaml: &str) -> Result<(Vec<PhaseNumber>, Orchestrator)> {
        let root = ConfigNode::from_yaml_str(yaml).unwrap();
        let orchestrator = Orchestrator::new();
        let phases = expand_phases(&root.get("Phases"), &orchestrator)?;
        Ok((phases.keys().copied().collect(), orchestrator))
    }

    #[test]
    fn test_implicit_phases_count_up() {
        let (numbers, orchestrator) = expand("Phases:\n- {}\n- {}\n- {}\n").unwrap();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert_eq!(orchestrator.max_phase(), 2);
    }

    #[test]
    fn test_explicit_range_is_honored_verbatim() {
        let (numbers, orchestrator) = expand("Phases:\n- {}\n- {}\n- Phase: 5..6\n").unwrap();
        assert_eq!(numbers, vec![0, 1, 5, 6]);
        assert_eq!(orchestrator.max_phase(), 6);
    }

    #[test]
    fn test_counter_advances_per_inserted_phase() {
        // Two numbers inserted by the range, so the implicit phase is 2.
        let (numbers, _) = expand("Phases:\n- Phase: [5, 6]\n- {}\n").unwrap();
        assert_eq!(numbers, vec![2, 5, 6]);
    }

    #[test]
    fn test_duplicate_phase_is_rejected() {
        let err = expand("Phases:\n- {}\n- Phase: 0\n").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Duplicate phase 0"));

        let err = expand("Phases:\n- Phase: 1..3\n- Phase: 3\n").unwrap_err();
        assert!(err.to_string().contains("Duplicate phase 3"));
    }

    #[test]
    fn test_null_phase_is_rejected() {
        let err = expand("Phases:\n- {}\n- ~\n").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Phases.1"));
    }

    #[test]
    fn test_missing_phases_is_empty() {
        let (numbers, orchestrator) = expand("Type: Nothing\n").unwrap();
        assert!(numbers.is_empty());
        assert_eq!(orchestrator.max_phase(), 0);
    }

    #[test]
    fn test_nop_flag() {
        let root = ConfigNode::from_yaml_str("Phases:\n- Nop: true\n- {}\n").unwrap();
        let phases = expand_phases(&root.get("Phases"), &Orchestrator::new()).unwrap();
        assert!(phases[&0].is_nop());
        assert!(!phases[&1].is_nop());
        assert_eq!(phases[&1].phase(), 1);
    }

    #[test]
    fn test_range_parsing() {
        assert_eq!("3".parse::<PhaseRangeSpec>().unwrap(), PhaseRangeSpec::single(3));
        assert_eq!(
            "2..4".parse::<PhaseRangeSpec>().unwrap(),
            PhaseRangeSpec { start: 2, end: 4 }
        );
        assert!("4..2".parse::<PhaseRangeSpec>().is_err());
        assert!("two".parse::<PhaseRangeSpec>().is_err());
        assert_eq!(PhaseRangeSpec { start: 2, end: 4 }.to_string(), "2..4");
    }

    #[test]
    fn test_oversized_range_is_rejected() {
        let err = expand("Phases:\n- Phase: 0..4000000000\n").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("spans more than"));

        let (numbers, _) = expand("Phases:\n- Phase: [0, 9999]\n").unwrap();
        assert_eq!(numbers.len(), 10_000);
    }

    #[test]
    fn test_malformed_range_in_config() {
        let err = expand("Phases:\n- Phase: {a: 1}\n").unwrap_err();
        assert!(err.to_string().contains("Phases.0.Phase"));
    }
}
