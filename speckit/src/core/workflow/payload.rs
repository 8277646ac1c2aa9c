//! Workflow kinds and their payloads.
//!
//! Each kind owns a payload struct. The reducer never matches on the kind when
//! handling deltas, completions or cancellation; it only talks to
//! [`WorkflowData`], whose default methods opt out of every capability.

use std::fmt;
use std::str::FromStr;

/// Capabilities a payload may expose to the generic transition logic.
pub trait WorkflowData: fmt::Debug {
    /// Accumulated agent output, if this kind keeps one.
    fn output(&self) -> Option<&str> {
        None
    }

    fn output_mut(&mut self) -> Option<&mut String> {
        None
    }

    fn record_cost(&mut self, _cost_usd: Option<f64>, _duration_secs: Option<f64>) {}

    fn record_session(&mut self, _session_id: &str) {}

    /// Session id the agent reported on completion.
    fn session_id(&self) -> Option<&str> {
        None
    }
}

/// One step of the spec pipeline, invoked as `/speckit.<step>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStep {
    Specify,
    Clarify,
    Plan,
    Tasks,
    Implement,
    Review,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 6] = [
        PipelineStep::Specify,
        PipelineStep::Clarify,
        PipelineStep::Plan,
        PipelineStep::Tasks,
        PipelineStep::Implement,
        PipelineStep::Review,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStep::Specify => "specify",
            PipelineStep::Clarify => "clarify",
            PipelineStep::Plan => "plan",
            PipelineStep::Tasks => "tasks",
            PipelineStep::Implement => "implement",
            PipelineStep::Review => "review",
        }
    }

    /// Slash command sent to the agent for this step.
    pub fn command(self, args: &str) -> String {
        let args = args.trim();
        if args.is_empty() {
            format!("/speckit.{}", self.as_str())
        } else {
            format!("/speckit.{} {args}", self.as_str())
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStep {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim().to_ascii_lowercase();
        PipelineStep::ALL
            .into_iter()
            .find(|step| step.as_str() == needle)
            .ok_or_else(|| {
                let known: Vec<&str> = PipelineStep::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown step '{value}' (expected one of: {})", known.join(", "))
            })
    }
}

/// What a start request asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowKind {
    Prompt {
        prompt: String,
    },
    PipelineStep {
        step: PipelineStep,
        feature_branch: String,
        args: String,
    },
}

impl WorkflowKind {
    /// Prompt text handed to the agent.
    pub fn prompt(&self) -> String {
        match self {
            WorkflowKind::Prompt { prompt } => prompt.clone(),
            WorkflowKind::PipelineStep { step, args, .. } => step.command(args),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            WorkflowKind::Prompt { .. } => None,
            WorkflowKind::PipelineStep { feature_branch, .. } => Some(feature_branch),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptData {
    pub prompt: String,
    pub output: String,
    pub agent_session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_secs: Option<f64>,
}

impl WorkflowData for PromptData {
    fn output(&self) -> Option<&str> {
        Some(&self.output)
    }

    fn output_mut(&mut self) -> Option<&mut String> {
        Some(&mut self.output)
    }

    fn record_cost(&mut self, cost_usd: Option<f64>, duration_secs: Option<f64>) {
        self.cost_usd = cost_usd.or(self.cost_usd);
        self.duration_secs = duration_secs.or(self.duration_secs);
    }

    fn record_session(&mut self, session_id: &str) {
        self.agent_session_id = Some(session_id.to_string());
    }

    fn session_id(&self) -> Option<&str> {
        self.agent_session_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStepData {
    pub step: PipelineStep,
    pub feature_branch: String,
    pub args: String,
    pub output: String,
    pub cost_usd: Option<f64>,
    pub duration_secs: Option<f64>,
    pub agent_session_id: Option<String>,
}

impl WorkflowData for PipelineStepData {
    fn output(&self) -> Option<&str> {
        Some(&self.output)
    }

    fn output_mut(&mut self) -> Option<&mut String> {
        Some(&mut self.output)
    }

    fn record_cost(&mut self, cost_usd: Option<f64>, duration_secs: Option<f64>) {
        self.cost_usd = cost_usd.or(self.cost_usd);
        self.duration_secs = duration_secs.or(self.duration_secs);
    }

    fn record_session(&mut self, session_id: &str) {
        self.agent_session_id = Some(session_id.to_string());
    }

    fn session_id(&self) -> Option<&str> {
        self.agent_session_id.as_deref()
    }
}

/// Tagged payload stored in a workflow entry.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowPayload {
    Prompt(PromptData),
    PipelineStep(PipelineStepData),
}

impl WorkflowPayload {
    pub fn from_kind(kind: &WorkflowKind) -> Self {
        match kind {
            WorkflowKind::Prompt { prompt } => WorkflowPayload::Prompt(PromptData {
                prompt: prompt.clone(),
                ..PromptData::default()
            }),
            WorkflowKind::PipelineStep {
                step,
                feature_branch,
                args,
            } => WorkflowPayload::PipelineStep(PipelineStepData {
                step: *step,
                feature_branch: feature_branch.clone(),
                args: args.clone(),
                output: String::new(),
                cost_usd: None,
                duration_secs: None,
                agent_session_id: None,
            }),
        }
    }

    pub fn as_data(&self) -> &dyn WorkflowData {
        match self {
            WorkflowPayload::Prompt(data) => data,
            WorkflowPayload::PipelineStep(data) => data,
        }
    }

    pub fn as_data_mut(&mut self) -> &mut dyn WorkflowData {
        match self {
            WorkflowPayload::Prompt(data) => data,
            WorkflowPayload::PipelineStep(data) => data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_command_formats_args() {
        assert_eq!(PipelineStep::Plan.command(""), "/speckit.plan");
        assert_eq!(
            PipelineStep::Specify.command("  add login  "),
            "/speckit.specify add login"
        );
    }

    #[test]
    fn step_parses_case_insensitively() {
        assert_eq!("Implement".parse::<PipelineStep>(), Ok(PipelineStep::Implement));
        let err = "deploy".parse::<PipelineStep>().expect_err("unknown step");
        assert!(err.contains("specify, clarify"));
    }

    #[test]
    fn default_capabilities_opt_out() {
        #[derive(Debug)]
        struct Silent;
        impl WorkflowData for Silent {}

        let mut silent = Silent;
        assert!(silent.output().is_none());
        assert!(silent.output_mut().is_none());
        silent.record_cost(Some(1.0), None);
        silent.record_session("s");
        assert!(silent.session_id().is_none());
    }

    #[test]
    fn record_cost_keeps_previous_when_absent() {
        let mut data = PromptData::default();
        data.record_cost(Some(0.25), Some(3.0));
        data.record_cost(None, Some(4.0));
        assert_eq!(data.cost_usd, Some(0.25));
        assert_eq!(data.duration_secs, Some(4.0));
    }
}
