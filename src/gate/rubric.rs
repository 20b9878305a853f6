//! Rating rubrics.

use serde::{Deserialize, Serialize};

/// Id of the built-in plan rubric.
pub const DEFAULT_RUBRIC: &str = "plan-default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Criterion {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

/// A named set of criteria handed to every provider with the plan content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub id: String,
    pub criteria: Vec<Criterion>,
}

impl Rubric {
    /// The default plan rubric: each criterion scored 0-10.
    pub fn plan_default() -> Self {
        Self {
            id: DEFAULT_RUBRIC.to_string(),
            criteria: vec![
                Criterion::new(
                    "completeness",
                    "Every requirement is addressed by at least one step",
                ),
                Criterion::new(
                    "feasibility",
                    "Steps are concrete and achievable with the listed agents",
                ),
                Criterion::new(
                    "risk_mitigation",
                    "Known risks have an explicit mitigation or fallback",
                ),
                Criterion::new(
                    "agent_coverage",
                    "Each step is assigned to an agent suited to it",
                ),
                Criterion::new(
                    "integration",
                    "Outputs of each step feed the steps that need them",
                ),
            ],
        }
    }

    pub fn builtin(id: &str) -> Option<Self> {
        (id == DEFAULT_RUBRIC).then(Self::plan_default)
    }

    pub fn criterion_names(&self) -> Vec<&str> {
        self.criteria.iter().map(|c| c.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_default_criteria() {
        let rubric = Rubric::builtin("plan-default").unwrap();
        assert_eq!(
            rubric.criterion_names(),
            vec![
                "completeness",
                "feasibility",
                "risk_mitigation",
                "agent_coverage",
                "integration"
            ]
        );
        assert!(Rubric::builtin("other").is_none());
    }
}
