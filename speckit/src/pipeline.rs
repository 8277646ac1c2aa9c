//! Sequential pipeline steps for `speckit step` and `speckit pipeline`.

use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::core::workflow::{PipelineStep, WorkflowId, WorkflowKind, WorkflowStatus};
use crate::executor::{StartOptions, WorkflowExecutor};

/// Why [`run_pipeline`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStop {
    /// Every requested step ran.
    Completed,
    /// A step failed and the pipeline stops on errors.
    Failed { step: PipelineStep, error: String },
    /// A step was cancelled. Later steps never run.
    Cancelled { step: PipelineStep },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: PipelineStep,
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub steps: Vec<StepReport>,
    pub stop: PipelineStop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Arguments appended to every step command.
    pub args: String,
    /// Start the first step in a new session. Later steps continue it.
    pub fresh: bool,
    pub stop_on_error: bool,
}

/// Run `steps` one after another on `feature_branch`, each as its own workflow.
///
/// `on_delta` sees the streamed output of every step. Cancelling `interrupt`
/// cancels the running step and ends the pipeline.
#[instrument(skip(executor, options, interrupt, on_delta), fields(steps = steps.len()))]
pub async fn run_pipeline<D>(
    executor: &mut WorkflowExecutor,
    feature_branch: &str,
    steps: &[PipelineStep],
    options: &PipelineOptions,
    interrupt: &CancellationToken,
    mut on_delta: D,
) -> Result<PipelineOutcome>
where
    D: FnMut(&WorkflowId, &str),
{
    let mut reports = Vec::new();
    let mut failure = None;

    for (index, &step) in steps.iter().enumerate() {
        let kind = WorkflowKind::PipelineStep {
            step,
            feature_branch: feature_branch.to_string(),
            args: options.args.clone(),
        };
        let start = StartOptions {
            branch: None,
            fresh: options.fresh && index == 0,
        };
        let workflow_id = executor.start(kind, start)?;
        info!(%step, workflow_id = %workflow_id, "running pipeline step");
        executor.run_until(interrupt, &mut on_delta).await?;

        let entry = executor
            .state()
            .workflow(&workflow_id)
            .ok_or_else(|| anyhow!("workflow {workflow_id} vanished"))?;
        let status = entry.status;
        let error = entry.error.clone();
        reports.push(StepReport {
            step,
            workflow_id,
            status,
        });

        match status {
            WorkflowStatus::Cancelled => {
                return Ok(PipelineOutcome {
                    steps: reports,
                    stop: PipelineStop::Cancelled { step },
                });
            }
            WorkflowStatus::Failed => {
                let error = error.unwrap_or_else(|| "step failed".to_string());
                if options.stop_on_error {
                    return Ok(PipelineOutcome {
                        steps: reports,
                        stop: PipelineStop::Failed { step, error },
                    });
                }
                if failure.is_none() {
                    failure = Some(PipelineStop::Failed { step, error });
                }
            }
            _ => {}
        }
    }

    Ok(PipelineOutcome {
        steps: reports,
        stop: failure.unwrap_or(PipelineStop::Completed),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::io::session_store::{MemoryPersistence, SessionStore};
    use crate::test_support::{Script, ScriptedLauncher};

    fn executor(launcher: ScriptedLauncher) -> (WorkflowExecutor, Arc<ScriptedLauncher>) {
        let launcher = Arc::new(launcher);
        let sessions = Arc::new(SessionStore::open(MemoryPersistence::default()).expect("store"));
        (WorkflowExecutor::new(launcher.clone(), sessions), launcher)
    }

    const STEPS: [PipelineStep; 3] = [
        PipelineStep::Plan,
        PipelineStep::Tasks,
        PipelineStep::Implement,
    ];

    #[tokio::test]
    async fn runs_steps_in_order_and_resumes_after_the_first() {
        let (mut executor, launcher) =
            executor(ScriptedLauncher::new().otherwise(Script::succeed(&["done"])));
        let mut output = String::new();
        let outcome = run_pipeline(
            &mut executor,
            "001-login",
            &STEPS,
            &PipelineOptions::default(),
            &CancellationToken::new(),
            |_, text| output.push_str(text),
        )
        .await
        .expect("pipeline");

        assert_eq!(outcome.stop, PipelineStop::Completed);
        assert_eq!(output, "donedonedone");
        let prompts: Vec<String> = launcher.launched().into_iter().map(|r| r.prompt).collect();
        assert_eq!(
            prompts,
            vec!["/speckit.plan", "/speckit.tasks", "/speckit.implement"]
        );
        let resumes: Vec<bool> = launcher
            .launched()
            .iter()
            .map(|r| r.session.as_ref().is_some_and(|s| s.resume))
            .collect();
        assert_eq!(resumes, vec![false, true, true]);
    }

    #[tokio::test]
    async fn fresh_rotates_the_session_once() {
        let (mut executor, launcher) =
            executor(ScriptedLauncher::new().otherwise(Script::succeed(&[])));
        let options = PipelineOptions {
            fresh: true,
            ..PipelineOptions::default()
        };
        run_pipeline(
            &mut executor,
            "001-login",
            &STEPS[..2],
            &options,
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .expect("first run");
        run_pipeline(
            &mut executor,
            "001-login",
            &STEPS[2..],
            &PipelineOptions::default(),
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .expect("second run");

        let bindings: Vec<_> = launcher
            .launched()
            .into_iter()
            .filter_map(|request| request.session)
            .collect();
        assert_eq!(bindings.len(), 3);
        assert!(bindings.iter().all(|b| b.id == bindings[0].id));
        let resumes: Vec<bool> = bindings.iter().map(|b| b.resume).collect();
        assert_eq!(resumes, vec![false, true, true]);
    }

    #[tokio::test]
    async fn stop_on_error_halts_at_the_failing_step() {
        let launcher = ScriptedLauncher::new()
            .on("/speckit.tasks", Script::fail(&[], "no plan"))
            .otherwise(Script::succeed(&[]));
        let (mut executor, launcher) = executor(launcher);
        let options = PipelineOptions {
            stop_on_error: true,
            ..PipelineOptions::default()
        };
        let outcome = run_pipeline(
            &mut executor,
            "001-login",
            &STEPS,
            &options,
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .expect("pipeline");

        assert_eq!(
            outcome.stop,
            PipelineStop::Failed {
                step: PipelineStep::Tasks,
                error: "no plan".to_string(),
            }
        );
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(launcher.launched().len(), 2);
    }

    #[tokio::test]
    async fn without_stop_on_error_every_step_runs() {
        let launcher = ScriptedLauncher::new()
            .on("/speckit.plan", Script::fail(&[], "flaky"))
            .otherwise(Script::succeed(&[]));
        let (mut executor, _) = executor(launcher);
        let outcome = run_pipeline(
            &mut executor,
            "001-login",
            &STEPS,
            &PipelineOptions::default(),
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .expect("pipeline");

        assert_eq!(outcome.steps.len(), 3);
        assert!(matches!(
            outcome.stop,
            PipelineStop::Failed {
                step: PipelineStep::Plan,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancellation_ends_the_pipeline() {
        let launcher = ScriptedLauncher::new().otherwise(Script::HangUntilCancelled {
            before: "thinking".to_string(),
            late: String::new(),
        });
        let (mut executor, launcher) = executor(launcher);
        let interrupt = CancellationToken::new();
        let trigger = interrupt.clone();
        let outcome = run_pipeline(
            &mut executor,
            "001-login",
            &STEPS,
            &PipelineOptions::default(),
            &interrupt,
            |_, _| trigger.cancel(),
        )
        .await
        .expect("pipeline");

        assert_eq!(
            outcome.stop,
            PipelineStop::Cancelled {
                step: PipelineStep::Plan
            }
        );
        assert_eq!(launcher.launched().len(), 1);
    }
}
