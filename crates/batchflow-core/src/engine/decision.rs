use std::sync::Arc;

use batchflow_types::execution::StepExecution;
use batchflow_types::model::DecisionDefinition;
use batchflow_types::status::ExecutionStatus;

use super::context::InjectionContext;
use super::flow::ElementOutcome;
use super::job::RuntimeJob;
use super::kernel::BatchKernel;
use crate::error::BatchError;

/// Runs a decider over the step executions of the preceding element.
///
/// The decider's answer is both the decision's exit status, matched by its
/// transition rules, and the job's exit status from then on.
pub(crate) struct DecisionController<'a> {
    kernel: &'a Arc<BatchKernel>,
    job: &'a Arc<RuntimeJob>,
    decision: &'a DecisionDefinition,
}

impl<'a> DecisionController<'a> {
    pub(crate) fn new(
        kernel: &'a Arc<BatchKernel>,
        job: &'a Arc<RuntimeJob>,
        decision: &'a DecisionDefinition,
    ) -> Self {
        Self {
            kernel,
            job,
            decision,
        }
    }

    pub(crate) async fn execute(
        &self,
        previous: &[StepExecution],
    ) -> Result<ElementOutcome, BatchError> {
        let ctx = InjectionContext::for_job(self.job.context.clone());
        let mut decider = self
            .kernel
            .services()
            .artifacts
            .create_decider(&self.decision.decider, &ctx)?;
        let exit_status = decider
            .decide(previous)
            .await
            .map_err(|e| BatchError::fatal(e.into()))?;

        tracing::info!(
            decision = %self.decision.id,
            exit_status = %exit_status,
            inputs = previous.len(),
            "decision made"
        );
        self.job.context.set_exit_status(exit_status.clone());
        Ok(ElementOutcome {
            status: ExecutionStatus::normal(Some(exit_status)),
            step_executions: previous.to_vec(),
        })
    }
}
