//! Decomposition plans.
//!
//! A plan is the Planner's output for a composite node: an ordered list of
//! child goals, each depending only on children listed before it. Because
//! dependencies point strictly backwards, the list order is already a valid
//! topological order and cycles cannot be expressed.

use serde::{Deserialize, Serialize};

/// A planned child before it becomes a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// What the child should accomplish
    pub goal: String,

    /// Indices of earlier children that must be done first
    #[serde(default, alias = "dependencies", alias = "dependsOn")]
    pub depends_on: Vec<usize>,
}

impl ChildSpec {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, index: usize) -> Self {
        self.depends_on.push(index);
        self
    }
}

/// A validated decomposition.
///
/// # Invariants
/// - at least 2 children
/// - every dependency index is smaller than the child's own index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    children: Vec<ChildSpec>,
    ordered: bool,
    reasoning: String,
}

impl Plan {
    /// Validate and build a plan.
    ///
    /// # Errors
    /// Returns `Err` on fewer than two children, an empty goal, a
    /// self-dependency or a dependency on a later (not yet defined) child.
    pub fn new(
        children: Vec<ChildSpec>,
        ordered: bool,
        reasoning: impl Into<String>,
    ) -> Result<Self, PlanError> {
        if children.len() < 2 {
            return Err(PlanError::TooFewChildren {
                count: children.len(),
            });
        }

        let mut children = children;
        for (index, child) in children.iter_mut().enumerate() {
            if child.goal.trim().is_empty() {
                return Err(PlanError::EmptyGoal { index });
            }
            for &dependency in &child.depends_on {
                if dependency == index {
                    return Err(PlanError::SelfDependency { index });
                }
                if dependency > index {
                    return Err(PlanError::ForwardDependency { index, dependency });
                }
            }
            child.depends_on.sort_unstable();
            child.depends_on.dedup();
        }

        Ok(Self {
            children,
            ordered,
            reasoning: reasoning.into(),
        })
    }

    pub fn children(&self) -> &[ChildSpec] {
        &self.children
    }

    /// Whether child results must be combined in dependency order.
    pub fn ordered(&self) -> bool {
        self.ordered
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Errors in plan validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("A plan needs at least 2 children, got {count}")]
    TooFewChildren { count: usize },

    #[error("Child {index} has an empty goal")]
    EmptyGoal { index: usize },

    #[error("Child {index} depends on itself")]
    SelfDependency { index: usize },

    #[error("Child {index} depends on child {dependency}, which is not defined before it")]
    ForwardDependency { index: usize, dependency: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_plan() {
        let plan = Plan::new(
            vec![
                ChildSpec::new("one"),
                ChildSpec::new("two").after(0),
                ChildSpec::new("three").after(1),
            ],
            true,
            "chain",
        )
        .expect("valid plan");

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.children()[2].depends_on, vec![1]);
    }

    #[test]
    fn test_rejects_singleton() {
        let err = Plan::new(vec![ChildSpec::new("only")], true, "").unwrap_err();
        assert_eq!(err, PlanError::TooFewChildren { count: 1 });

        let err = Plan::new(vec![], true, "").unwrap_err();
        assert_eq!(err, PlanError::TooFewChildren { count: 0 });
    }

    #[test]
    fn test_rejects_bad_dependencies() {
        let err = Plan::new(
            vec![ChildSpec::new("a").after(0), ChildSpec::new("b")],
            true,
            "",
        )
        .unwrap_err();
        assert_eq!(err, PlanError::SelfDependency { index: 0 });

        let err = Plan::new(
            vec![ChildSpec::new("a").after(1), ChildSpec::new("b")],
            true,
            "",
        )
        .unwrap_err();
        assert_eq!(err, PlanError::ForwardDependency { index: 0, dependency: 1 });
    }

    #[test]
    fn test_dedups_dependencies() {
        let plan = Plan::new(
            vec![
                ChildSpec::new("a"),
                ChildSpec::new("b"),
                ChildSpec::new("c").after(1).after(0).after(1),
            ],
            false,
            "",
        )
        .expect("valid plan");
        assert_eq!(plan.children()[2].depends_on, vec![0, 1]);
        assert!(!plan.ordered());
    }

    #[test]
    fn test_deserialize_aliases() {
        let spec: ChildSpec =
            serde_json::from_str(r#"{"goal": "x", "dependsOn": [0]}"#).expect("child spec");
        assert_eq!(spec.depends_on, vec![0]);
    }
}
