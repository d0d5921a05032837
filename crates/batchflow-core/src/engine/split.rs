//! Concurrent flows.
//!
//! Every flow of a split runs as its own flow-in-split sub-job on the pool.
//! The split waits for all of them and folds their outcomes into one.

use std::sync::Arc;

use batchflow_types::model::{FlowDefinition, JobDefinition, SplitDefinition};
use batchflow_types::status::{ExecutionStatus, ExtendedBatchStatus};
use tokio::sync::mpsc;

use super::flow::ElementOutcome;
use super::job::{JobController, RuntimeJob, RuntimeKind};
use super::kernel::{BatchKernel, SubJob};
use crate::error::BatchError;

pub(crate) struct SplitController<'a> {
    kernel: &'a Arc<BatchKernel>,
    job: &'a Arc<RuntimeJob>,
    split: &'a SplitDefinition,
}

impl<'a> SplitController<'a> {
    pub(crate) fn new(
        kernel: &'a Arc<BatchKernel>,
        job: &'a Arc<RuntimeJob>,
        split: &'a SplitDefinition,
    ) -> Self {
        Self { kernel, job, split }
    }

    fn flow_definition(&self, flow: &FlowDefinition) -> JobDefinition {
        JobDefinition {
            id: format!(
                "{}:{}:{}",
                self.job.instance.instance_id, self.split.id, flow.id
            ),
            restartable: true,
            properties: self.job.definition.properties.clone(),
            listeners: Vec::new(),
            elements: flow.elements.clone(),
        }
    }

    pub(crate) async fn execute(&self) -> Result<ElementOutcome, BatchError> {
        let (tx, mut rx) = mpsc::channel(self.split.flows.len().max(1));
        let mut outcomes = Vec::with_capacity(self.split.flows.len());

        for flow in &self.split.flows {
            let built = self
                .kernel
                .build_sub_job(
                    self.job,
                    self.flow_definition(flow),
                    RuntimeKind::FlowInSplit,
                    false,
                    self.job.context.stop_token(),
                )
                .await?;
            match built {
                SubJob::Run(sub_job) => {
                    let kernel = self.kernel.clone();
                    let tx = tx.clone();
                    self.kernel.services().pool.execute_parallel_task(Box::pin(async move {
                        let result = JobController::new(&kernel, &sub_job)
                            .run_flow_in_split()
                            .await;
                        let _ = tx.send(result).await;
                    }));
                }
                SubJob::AlreadyCompleted { exit_status } => {
                    tracing::debug!(split = %self.split.id, flow = %flow.id, "flow already completed");
                    outcomes.push(ElementOutcome {
                        status: ExecutionStatus::normal(exit_status),
                        step_executions: Vec::new(),
                    });
                }
            }
        }
        drop(tx);

        let mut first_error = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::warn!(split = %self.split.id, error = %e, "flow in split failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let outcome = aggregate(outcomes);
        tracing::info!(
            split = %self.split.id,
            status = %outcome.status.extended,
            "split finished"
        );
        Ok(outcome)
    }
}

/// Fold flow outcomes: any failure wins, then `fail` > `stop` > `end`, then an
/// operator stop, otherwise normal completion.
fn aggregate(outcomes: Vec<ElementOutcome>) -> ElementOutcome {
    let rank = |extended: ExtendedBatchStatus| match extended {
        ExtendedBatchStatus::ExceptionThrown => 5,
        ExtendedBatchStatus::JslFail => 4,
        ExtendedBatchStatus::JslStop => 3,
        ExtendedBatchStatus::JslEnd => 2,
        ExtendedBatchStatus::JobOperatorStopping => 1,
        _ => 0,
    };

    let mut winner: Option<ExecutionStatus> = None;
    let mut step_executions = Vec::new();
    for outcome in outcomes {
        let better = winner
            .as_ref()
            .is_none_or(|w| rank(outcome.status.extended) > rank(w.extended));
        if better && rank(outcome.status.extended) > 0 {
            winner = Some(outcome.status);
        }
        step_executions.extend(outcome.step_executions);
    }

    ElementOutcome {
        status: winner.unwrap_or_else(|| ExecutionStatus::normal(None)),
        step_executions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(extended: ExtendedBatchStatus, exit: &str) -> ElementOutcome {
        ElementOutcome {
            status: ExecutionStatus::new(extended, Some(exit.to_string())),
            step_executions: Vec::new(),
        }
    }

    #[test]
    fn test_failure_outranks_terminating_transitions() {
        let folded = aggregate(vec![
            outcome(ExtendedBatchStatus::JslEnd, "END"),
            outcome(ExtendedBatchStatus::ExceptionThrown, "BOOM"),
            outcome(ExtendedBatchStatus::JslFail, "FAIL"),
        ]);
        assert_eq!(folded.status.extended, ExtendedBatchStatus::ExceptionThrown);
        assert_eq!(folded.status.exit_status.as_deref(), Some("BOOM"));
    }

    #[test]
    fn test_fail_beats_stop_beats_end() {
        let folded = aggregate(vec![
            outcome(ExtendedBatchStatus::JslEnd, "END"),
            outcome(ExtendedBatchStatus::JslStop, "STOP"),
        ]);
        assert_eq!(folded.status.extended, ExtendedBatchStatus::JslStop);

        let folded = aggregate(vec![
            outcome(ExtendedBatchStatus::JslStop, "STOP"),
            outcome(ExtendedBatchStatus::JslFail, "FAIL"),
        ]);
        assert_eq!(folded.status.extended, ExtendedBatchStatus::JslFail);
    }

    #[test]
    fn test_all_normal_folds_to_normal_without_exit() {
        let folded = aggregate(vec![
            outcome(ExtendedBatchStatus::NormalCompletion, "A"),
            outcome(ExtendedBatchStatus::DoNotRun, "B"),
        ]);
        assert_eq!(folded.status, ExecutionStatus::normal(None));
    }

    use batchflow_types::model::{
        ArtifactRef, DecisionDefinition, ExecutionElement, FlowDefinition, SplitDefinition,
    };
    use batchflow_types::status::BatchStatus;

    use crate::test_support::{Harness, batchlet_step, failing_script, job, script, step};

    fn flow(id: &str, step_id: &str, batchlet: ArtifactRef) -> FlowDefinition {
        FlowDefinition {
            id: id.to_string(),
            elements: vec![step(batchlet_step(step_id, batchlet))],
            next: None,
            transitions: Vec::new(),
        }
    }

    fn split_then_decide(flows: Vec<FlowDefinition>) -> Vec<ExecutionElement> {
        vec![
            ExecutionElement::Split(SplitDefinition {
                id: "fan_out".to_string(),
                flows,
                next: Some("d".to_string()),
            }),
            ExecutionElement::Decision(DecisionDefinition {
                id: "d".to_string(),
                decider: ArtifactRef::new("decide").with_property("decision", "ALL_DONE"),
                transitions: Vec::new(),
            }),
        ]
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_decision_after_split_sees_every_flow() {
        let harness = Harness::new();
        harness.register(job(
            "parallel",
            split_then_decide(vec![
                flow("f1", "a1", script("A1")),
                flow("f2", "a2", script("A2")),
            ]),
        ));

        let execution = harness.run("parallel").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.as_deref(), Some("ALL_DONE"));

        let mut seen = harness.probes.decided_over.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a1", "a2"]);
        assert_eq!(
            harness.operator.get_job_names().await.unwrap(),
            vec!["parallel"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_flow_fails_the_job() {
        let harness = Harness::new();
        harness.register(job(
            "parallel",
            split_then_decide(vec![
                flow("f1", "a1", script("A1")),
                flow("f2", "a2", failing_script()),
            ]),
        ));

        let execution = harness.run("parallel").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Failed);
        assert!(harness.probes.decided_over.lock().is_empty());
    }
}
