//! Plans and steps.
//!
//! Status transitions only move forward; every transition method returns
//! [`KernelError::InvalidTransition`] when asked to do otherwise. Once a plan
//! is terminal its steps can no longer be borrowed mutably.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle of a whole plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(KernelError::Internal(format!("unknown plan status: {other}"))),
        }
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Not executed; the plan gave up on it.
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One tool invocation inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Ids of steps that must be `completed` before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Where to write the string-formatted result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    /// Create a pending step with a fresh id.
    pub fn new(
        description: impl Into<String>,
        tool: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            id: crate::new_id(),
            description: description.into(),
            tool: tool.into(),
            arguments,
            depends_on: Vec::new(),
            output_file: None,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_file(mut self, path: impl Into<String>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    fn invalid(&self, to: StepStatus) -> KernelError {
        KernelError::InvalidTransition {
            entity: "step",
            id: self.id.clone(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// pending -> running
    pub fn start(&mut self) -> Result<()> {
        if self.status != StepStatus::Pending {
            return Err(self.invalid(StepStatus::Running));
        }
        self.status = StepStatus::Running;
        self.started_at = Some(crate::now());
        Ok(())
    }

    /// running -> completed
    pub fn complete(&mut self, result: Value) -> Result<()> {
        if self.status != StepStatus::Running {
            return Err(self.invalid(StepStatus::Completed));
        }
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(crate::now());
        Ok(())
    }

    /// pending|running -> failed
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid(StepStatus::Failed));
        }
        self.status = StepStatus::Failed;
        self.error = Some(non_empty(error.into(), "step failed"));
        self.completed_at = Some(crate::now());
        Ok(())
    }

    /// pending -> skipped
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.status != StepStatus::Pending {
            return Err(self.invalid(StepStatus::Skipped));
        }
        self.status = StepStatus::Skipped;
        self.error = Some(non_empty(reason.into(), "step skipped"));
        self.completed_at = Some(crate::now());
        Ok(())
    }
}

fn non_empty(s: String, fallback: &str) -> String {
    if s.trim().is_empty() {
        fallback.to_string()
    } else {
        s
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A structured multi-step program synthesized for a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    pub session_id: String,
    steps: Vec<Step>,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// Create a pending plan with a fresh id.
    pub fn new(goal: impl Into<String>, session_id: impl Into<String>, steps: Vec<Step>) -> Self {
        let now = crate::now();
        Self {
            id: crate::new_id(),
            goal: goal.into(),
            session_id: session_id.into(),
            steps,
            status: PlanStatus::Pending,
            reasoning: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Mutable access to one step; refused once the plan is terminal.
    pub fn step_mut(&mut self, index: usize) -> Result<&mut Step> {
        if self.status.is_terminal() {
            return Err(KernelError::PlanFinalized {
                plan_id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.steps.get_mut(index).ok_or_else(|| KernelError::StepNotFound {
            step: index.to_string(),
        })
    }

    pub fn step_by_id(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Whether every dependency of `steps[index]` is `completed`.
    pub fn dependencies_satisfied(&self, index: usize) -> bool {
        let Some(step) = self.steps.get(index) else {
            return false;
        };
        step.depends_on.iter().all(|dep| {
            self.step_by_id(dep)
                .is_some_and(|d| d.status == StepStatus::Completed)
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Result of the last step, when that step completed.
    pub fn final_result(&self) -> Option<&Value> {
        self.steps
            .last()
            .filter(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.result.as_ref())
    }

    pub fn touch(&mut self) {
        self.updated_at = crate::now().max(self.created_at);
    }

    fn invalid(&self, to: PlanStatus) -> KernelError {
        KernelError::InvalidTransition {
            entity: "plan",
            id: self.id.clone(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// pending -> running
    pub fn start(&mut self) -> Result<()> {
        if self.status != PlanStatus::Pending {
            return Err(self.invalid(PlanStatus::Running));
        }
        self.status = PlanStatus::Running;
        self.touch();
        Ok(())
    }

    /// running -> completed|failed
    pub fn finish(&mut self, status: PlanStatus, error: Option<String>) -> Result<()> {
        if self.status != PlanStatus::Running || !status.is_terminal() {
            return Err(self.invalid(status));
        }
        self.status = status;
        self.error = error;
        self.touch();
        Ok(())
    }
}
