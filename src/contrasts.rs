//! Contrast resolution
//!
//! Maps the fixed catalogue of symbolic contrast names onto a fitted
//! design's realized condition columns. Conditions can drop out of a design
//! (a subject may never miss a reward trial, for example), so every
//! reference is resolved by name lookup against the realized ordering —
//! never by catalogue position — and a contrast whose conditions are absent
//! is skipped, not an error.

use tracing::warn;

/// A symbolic contrast: either one condition taken directly, or a signed
/// difference of two conditions (+1 / −1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContrastSpec {
    Simple {
        name: &'static str,
        condition: &'static str,
    },
    Paired {
        name: &'static str,
        plus: &'static str,
        minus: &'static str,
    },
}

impl ContrastSpec {
    pub fn name(&self) -> &'static str {
        match self {
            ContrastSpec::Simple { name, .. } | ContrastSpec::Paired { name, .. } => name,
        }
    }
}

const ANTICIP_REWARD: &str = "anticipation-reward";
const ANTICIP_NEUTRAL: &str = "anticipation-neutral";
const FB_REWARD_OK: &str = "feedback-reward-success";
const FB_REWARD_MISS: &str = "feedback-reward-failure";
const FB_NEUTRAL_OK: &str = "feedback-neutral-success";
const FB_NEUTRAL_MISS: &str = "feedback-neutral-failure";

/// The fixed, ordered contrast catalogue: six paired signed-difference
/// contrasts followed by six single-condition contrasts.
pub const CATALOGUE: [ContrastSpec; 12] = [
    ContrastSpec::Paired {
        name: "anticipation-reward-vs-neutral",
        plus: ANTICIP_REWARD,
        minus: ANTICIP_NEUTRAL,
    },
    ContrastSpec::Paired {
        name: "anticipation-neutral-vs-reward",
        plus: ANTICIP_NEUTRAL,
        minus: ANTICIP_REWARD,
    },
    ContrastSpec::Paired {
        name: "feedback-reward-vs-neutral-success",
        plus: FB_REWARD_OK,
        minus: FB_NEUTRAL_OK,
    },
    ContrastSpec::Paired {
        name: "feedback-neutral-vs-reward-success",
        plus: FB_NEUTRAL_OK,
        minus: FB_REWARD_OK,
    },
    ContrastSpec::Paired {
        name: "feedback-reward-success-vs-failure",
        plus: FB_REWARD_OK,
        minus: FB_REWARD_MISS,
    },
    ContrastSpec::Paired {
        name: "feedback-neutral-success-vs-failure",
        plus: FB_NEUTRAL_OK,
        minus: FB_NEUTRAL_MISS,
    },
    ContrastSpec::Simple {
        name: ANTICIP_REWARD,
        condition: ANTICIP_REWARD,
    },
    ContrastSpec::Simple {
        name: ANTICIP_NEUTRAL,
        condition: ANTICIP_NEUTRAL,
    },
    ContrastSpec::Simple {
        name: FB_REWARD_OK,
        condition: FB_REWARD_OK,
    },
    ContrastSpec::Simple {
        name: FB_REWARD_MISS,
        condition: FB_REWARD_MISS,
    },
    ContrastSpec::Simple {
        name: FB_NEUTRAL_OK,
        condition: FB_NEUTRAL_OK,
    },
    ContrastSpec::Simple {
        name: FB_NEUTRAL_MISS,
        condition: FB_NEUTRAL_MISS,
    },
];

/// Numeric or by-name contrast definition handed to the model-fit engine
#[derive(Debug, Clone, PartialEq)]
pub enum ContrastDefinition {
    /// Direct reference to one realized condition column
    Condition(String),
    /// Signed weight vector over the realized condition ordering
    Weights(Vec<f64>),
}

/// Why a contrast was not constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A referenced condition is absent from the realized design
    MissingCondition(String),
    /// The symbolic name is not in the catalogue
    UnknownContrast,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingCondition(c) => write!(f, "missing condition: {c}"),
            SkipReason::UnknownContrast => write!(f, "unknown contrast name"),
        }
    }
}

/// One successfully resolved contrast
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedContrast {
    pub name: String,
    pub definition: ContrastDefinition,
}

/// Resolve one symbolic name against the realized condition ordering.
pub fn resolve_contrast(
    name: &str,
    conditions: &[String],
) -> Result<ContrastDefinition, SkipReason> {
    let spec = CATALOGUE
        .iter()
        .find(|s| s.name() == name)
        .ok_or(SkipReason::UnknownContrast)?;

    let index_of = |condition: &str| -> Result<usize, SkipReason> {
        conditions
            .iter()
            .position(|c| c == condition)
            .ok_or_else(|| SkipReason::MissingCondition(condition.to_string()))
    };

    match spec {
        ContrastSpec::Simple { condition, .. } => {
            index_of(condition)?;
            Ok(ContrastDefinition::Condition(condition.to_string()))
        }
        ContrastSpec::Paired { plus, minus, .. } => {
            let plus_idx = index_of(plus)?;
            let minus_idx = index_of(minus)?;
            let mut weights = vec![0.0; conditions.len()];
            weights[plus_idx] = 1.0;
            weights[minus_idx] = -1.0;
            Ok(ContrastDefinition::Weights(weights))
        }
    }
}

/// Resolve the whole catalogue, in declaration order, against a realized
/// design. Skipped entries are logged and absent from the returned set.
pub fn resolve_catalogue(conditions: &[String]) -> Vec<ResolvedContrast> {
    let mut resolved = Vec::new();
    for spec in &CATALOGUE {
        match resolve_contrast(spec.name(), conditions) {
            Ok(definition) => resolved.push(ResolvedContrast {
                name: spec.name().to_string(),
                definition,
            }),
            Err(reason) => {
                warn!(contrast = spec.name(), %reason, "skipping contrast");
            }
        }
    }
    resolved
}
