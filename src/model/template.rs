//! Step template: the ordered procedure a worker must follow.
//!
//! A template is a read-only input to the engine. Tasks and steps carry an
//! `order_index`; flattening tasks then steps by that index yields the
//! canonical sequence the sequencer walks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Newtype for template IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub Uuid);

impl TemplateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TemplateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Newtype for step IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A known hazard attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hazard {
    pub description: String,
    /// Free-form severity label (e.g. "high", "critical").
    pub severity: String,
    pub mitigation: Option<String>,
}

/// Atomic unit of work with an expected action/result and known hazards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub description: String,
    pub expected_action: Option<String>,
    pub expected_result: Option<String>,
    pub order_index: u32,
    pub hazards: Vec<Hazard>,
}

/// A group of ordered steps within a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    pub description: Option<String>,
    pub order_index: u32,
    pub steps: Vec<Step>,
}

impl Task {
    /// Append a step, taking the next order index.
    pub fn add_step(&mut self, description: impl Into<String>) -> &mut Step {
        let step = Step {
            id: StepId::new(),
            description: description.into(),
            expected_action: None,
            expected_result: None,
            order_index: self.steps.len() as u32,
            hazards: Vec::new(),
        };
        self.steps.push(step);
        self.steps.last_mut().unwrap()
    }
}

/// Ordered procedure template. Aggregate root, immutable during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SopTemplate {
    pub id: TemplateId,
    pub title: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

impl SopTemplate {
    pub fn new(title: impl Into<String>, created_by: Uuid) -> Self {
        Self {
            id: TemplateId::new(),
            title: title.into(),
            created_by,
            created_at: Utc::now(),
            tasks: Vec::new(),
        }
    }

    /// Append a task, taking the next order index.
    pub fn add_task(&mut self, title: impl Into<String>) -> &mut Task {
        let task = Task {
            title: title.into(),
            description: None,
            order_index: self.tasks.len() as u32,
            steps: Vec::new(),
        };
        self.tasks.push(task);
        self.tasks.last_mut().unwrap()
    }

    /// Total number of steps across all tasks.
    pub fn step_count(&self) -> usize {
        self.tasks.iter().map(|t| t.steps.len()).sum()
    }

    /// Structural validation. A template must have a title, at least one
    /// task, and every task must have at least one described step.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.title.trim().is_empty() {
            problems.push("template title is required".to_string());
        }
        if self.tasks.is_empty() {
            problems.push("template must have at least one task".to_string());
        }
        for task in &self.tasks {
            if task.title.trim().is_empty() {
                problems.push(format!("task {} title is required", task.order_index + 1));
            }
            if task.steps.is_empty() {
                problems.push(format!("task '{}' must have at least one step", task.title));
            }
            for step in &task.steps {
                if step.description.trim().is_empty() {
                    problems.push(format!(
                        "step {} in task '{}' must have a description",
                        step.order_index + 1,
                        task.title
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_template_passes_validation() {
        let mut t = SopTemplate::new("Valve shutdown", Uuid::new_v4());
        let task = t.add_task("Close intake");
        task.add_step("Close valve A");
        task.add_step("Verify gauge reads zero");

        assert!(t.validate().is_ok());
        assert_eq!(t.step_count(), 2);
    }

    #[test]
    fn template_without_tasks_fails_validation() {
        let t = SopTemplate::new("Empty", Uuid::new_v4());
        assert!(matches!(t.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn task_without_steps_fails_validation() {
        let mut t = SopTemplate::new("Half-built", Uuid::new_v4());
        t.add_task("No steps yet");
        assert!(matches!(t.validate(), Err(Error::Validation(_))));
    }
}
