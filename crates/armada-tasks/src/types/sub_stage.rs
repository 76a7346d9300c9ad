//! Workflow-specific sub-stages inside the `STARTED` stage.
//!
//! Every workflow declares its own fieldless enum and implements
//! [`SubStage`] for it. Handlers match on that enum exhaustively, so a
//! sub-stage without a handler arm does not compile.
//!
//! Sub-stages travel on the wire by name (`"ALLOCATED"`), which lets a
//! child task address its parent's sub-stages without knowing the
//! parent's enum type.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// A workflow's ordered set of named steps.
///
/// `ALL` lists the variants in declaration order; that order defines the
/// happy path. The default transition table allows any forward move and a
/// move to `ERROR` from anywhere; workflows with a stricter table override
/// [`can_advance_to`](SubStage::can_advance_to).
///
/// # Examples
///
/// ```
/// use armada_tasks::{DefaultSubStage, SubStage};
///
/// assert_eq!(DefaultSubStage::from_name("PROCESSING"), Some(DefaultSubStage::Processing));
/// assert!(DefaultSubStage::Created.can_advance_to(DefaultSubStage::Completed));
/// assert!(!DefaultSubStage::Completed.can_advance_to(DefaultSubStage::Processing));
/// assert_eq!(DefaultSubStage::Processing.progress(), 50);
/// ```
pub trait SubStage: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Initial sub-stage assigned on creation.
    const CREATED: Self;
    /// Successful end of the happy path.
    const COMPLETED: Self;
    /// Failure sub-stage, reachable from every other sub-stage.
    const ERROR: Self;
    /// All variants in happy-path order.
    const ALL: &'static [Self];

    /// Wire name of the variant.
    fn name(self) -> &'static str;

    /// Sub-stages whose updates may arrive out of order. A late update
    /// targeting an earlier transient sub-stage is dropped instead of
    /// rejected.
    fn is_transient(self) -> bool {
        false
    }

    /// Position in [`ALL`](SubStage::ALL).
    fn ordinal(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    /// Parses a wire name.
    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Declared transition table.
    fn can_advance_to(self, next: Self) -> bool {
        next != self && (next == Self::ERROR || next.ordinal() > self.ordinal())
    }

    /// Completion percentage: `100 * ordinal / (len - 2)`, capped at 100.
    fn progress(self) -> u8 {
        let steps = Self::ALL.len().saturating_sub(2).max(1);
        let pct = (100 * self.ordinal() / steps).min(100);
        u8::try_from(pct).unwrap_or(100)
    }
}

/// Sub-stages for workflows with a single processing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultSubStage {
    Created,
    Processing,
    Completed,
    Error,
}

impl SubStage for DefaultSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::Processing,
        Self::Completed,
        Self::Error,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

/// Serde adapter storing a [`SubStage`] by its wire name.
///
/// Used with `#[serde(with = "crate::types::sub_stage::by_name")]`.
pub mod by_name {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::SubStage;

    pub fn serialize<S: SubStage, Ser: Serializer>(
        value: &S,
        serializer: Ser,
    ) -> Result<Ser::Ok, Ser::Error> {
        serializer.serialize_str(value.name())
    }

    pub fn deserialize<'de, S: SubStage, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<S, D::Error> {
        let name = String::deserialize(deserializer)?;
        S::from_name(&name).ok_or_else(|| D::Error::custom(format!("unknown sub-stage {name}")))
    }
}

/// A `(stage, sub-stage)` pair addressed by name, as carried by task links.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTarget {
    pub stage: crate::types::stage::TaskStage,
    pub sub_stage: String,
}

impl StageTarget {
    /// Targets `sub_stage` inside `STARTED`.
    pub fn started<S: SubStage>(sub_stage: S) -> Self {
        Self {
            stage: crate::types::stage::TaskStage::Started,
            sub_stage: sub_stage.name().to_string(),
        }
    }
}

impl fmt::Display for StageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.stage, self.sub_stage)
    }
}
