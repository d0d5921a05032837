//! Navigation over one scope of execution elements.
//!
//! The transitioner runs the elements of a job, flow or flow-in-split in
//! the order their transition rules dictate. Terminating outcomes (`end`,
//! `fail`, `stop` transitions and operator stops) escape every nested scope
//! immediately; everything else is matched against the finished element's
//! transition rules.

use std::sync::Arc;

use batchflow_types::execution::StepExecution;
use batchflow_types::model::{ExecutionElement, find_element};
use batchflow_types::status::{ExecutionStatus, ExtendedBatchStatus};
use futures_util::future::BoxFuture;

use super::decision::DecisionController;
use super::job::RuntimeJob;
use super::kernel::BatchKernel;
use super::split::SplitController;
use super::step::StepController;
use super::transition::{Navigation, navigate};
use crate::error::BatchError;

/// What one element (or a whole scope) finished with.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ElementOutcome {
    pub status: ExecutionStatus,
    /// Step executions produced by the element; handed to a following decider.
    pub step_executions: Vec<StepExecution>,
}

impl ElementOutcome {
    fn terminating(extended: ExtendedBatchStatus, exit_status: Option<String>) -> Self {
        Self {
            status: ExecutionStatus::new(extended, exit_status),
            step_executions: Vec::new(),
        }
    }

    fn escapes_scope(&self) -> bool {
        matches!(
            self.status.extended,
            ExtendedBatchStatus::JslEnd
                | ExtendedBatchStatus::JslFail
                | ExtendedBatchStatus::JslStop
                | ExtendedBatchStatus::JobOperatorStopping
        )
    }
}

pub(crate) struct ExecutionTransitioner<'a> {
    kernel: &'a Arc<BatchKernel>,
    job: &'a Arc<RuntimeJob>,
    elements: &'a [ExecutionElement],
    start_at: Option<&'a str>,
}

impl<'a> ExecutionTransitioner<'a> {
    pub(crate) fn new(
        kernel: &'a Arc<BatchKernel>,
        job: &'a Arc<RuntimeJob>,
        elements: &'a [ExecutionElement],
        start_at: Option<&'a str>,
    ) -> Self {
        Self {
            kernel,
            job,
            elements,
            start_at,
        }
    }

    fn first_element(&self) -> Result<&'a ExecutionElement, BatchError> {
        if let Some(id) = self.start_at {
            match find_element(self.elements, id) {
                Some(element) => return Ok(element),
                None => tracing::warn!(
                    restart_on = id,
                    job = %self.job.context.job_name(),
                    "restart position not found, starting from the first element"
                ),
            }
        }
        self.elements.first().ok_or_else(|| {
            BatchError::InvalidDefinition(format!(
                "job '{}' has no execution elements",
                self.job.context.job_name()
            ))
        })
    }

    /// Run the scope to completion. Boxed because flows recurse.
    pub(crate) fn run(self) -> BoxFuture<'a, Result<ElementOutcome, BatchError>> {
        Box::pin(async move {
            let mut current = self.first_element()?;
            let mut previous: Option<ElementOutcome> = None;
            let mut previous_decision: Option<&str> = None;

            loop {
                if self.job.context.is_stop_requested() {
                    let exit_status = previous.as_ref().and_then(|p| p.status.exit_status.clone());
                    return Ok(ElementOutcome::terminating(
                        ExtendedBatchStatus::JobOperatorStopping,
                        exit_status,
                    ));
                }

                tracing::debug!(
                    element = current.id(),
                    execution_id = self.job.execution_id,
                    "running element"
                );
                let outcome = match current {
                    ExecutionElement::Step(step) => {
                        StepController::new(self.kernel, self.job, step, None)
                            .execute()
                            .await?
                    }
                    ExecutionElement::Decision(decision) => {
                        if let Some(prev) = previous_decision {
                            return Err(BatchError::DecisionAfterDecision {
                                previous: prev.to_string(),
                                decision: decision.id.clone(),
                            });
                        }
                        let executions = previous
                            .as_ref()
                            .map(|p| p.step_executions.as_slice())
                            .unwrap_or_default();
                        DecisionController::new(self.kernel, self.job, decision)
                            .execute(executions)
                            .await?
                    }
                    ExecutionElement::Flow(flow) => {
                        ExecutionTransitioner::new(self.kernel, self.job, &flow.elements, None)
                            .run()
                            .await?
                    }
                    ExecutionElement::Split(split) => {
                        SplitController::new(self.kernel, self.job, split)
                            .execute()
                            .await?
                    }
                };

                if outcome.escapes_scope() {
                    return Ok(outcome);
                }
                if self.job.context.is_stop_requested() {
                    return Ok(ElementOutcome {
                        status: ExecutionStatus::new(
                            ExtendedBatchStatus::JobOperatorStopping,
                            outcome.status.exit_status,
                        ),
                        step_executions: outcome.step_executions,
                    });
                }

                match navigate(current, &outcome.status) {
                    Navigation::To(id) => {
                        let Some(next) = find_element(self.elements, &id) else {
                            return Err(BatchError::InvalidDefinition(format!(
                                "element '{}' transitions to unknown element '{id}'",
                                current.id()
                            )));
                        };
                        previous_decision = current.is_decision().then(|| current.id());
                        current = next;
                        previous = Some(outcome);
                    }
                    Navigation::End { exit_status } => {
                        return Ok(self.terminate(ExtendedBatchStatus::JslEnd, exit_status, outcome));
                    }
                    Navigation::Fail { exit_status } => {
                        return Ok(self.terminate(ExtendedBatchStatus::JslFail, exit_status, outcome));
                    }
                    Navigation::Stop {
                        exit_status,
                        restart,
                    } => {
                        let mut stopped =
                            self.terminate(ExtendedBatchStatus::JslStop, exit_status, outcome);
                        stopped.status.restart_on = restart;
                        return Ok(stopped);
                    }
                    Navigation::Finish => return Ok(outcome),
                }
            }
        })
    }

    /// An explicit exit status on a terminating transition becomes the job's.
    fn terminate(
        &self,
        extended: ExtendedBatchStatus,
        exit_status: Option<String>,
        outcome: ElementOutcome,
    ) -> ElementOutcome {
        let exit_status = match exit_status {
            Some(exit) => {
                self.job.context.set_exit_status(exit.clone());
                Some(exit)
            }
            None => outcome.status.exit_status,
        };
        tracing::info!(
            job = %self.job.context.job_name(),
            execution_id = self.job.execution_id,
            status = %extended,
            exit_status = ?exit_status,
            "job terminated by transition"
        );
        ElementOutcome {
            status: ExecutionStatus::new(extended, exit_status),
            step_executions: outcome.step_executions,
        }
    }
}
