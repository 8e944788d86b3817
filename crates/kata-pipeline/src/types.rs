use kata_core::{DeploymentMode, ModeSource};
use kata_proxy::ReconcileOutcome;
use kata_runtime::BackendOutput;
use serde::Serialize;

/// Steps of one pipeline run. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Resolved,
    Generated,
    Routed,
    Started,
    Failed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PipelineState::Received => "received",
            PipelineState::Resolved => "resolved",
            PipelineState::Generated => "generated",
            PipelineState::Routed => "routed",
            PipelineState::Started => "started",
            PipelineState::Failed => "failed",
        })
    }
}

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A push to the deploy branch; the checkout is reset to `rev`.
    Push { rev: String },
    /// Operator restart request; the checkout is left as is.
    Restart,
    /// Operator deploy of the current checkout.
    Manual,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Push { rev } => {
                let short: String = rev.chars().take(12).collect();
                write!(f, "push {short}")
            }
            Trigger::Restart => f.write_str("restart"),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub app: String,
    pub mode: DeploymentMode,
    pub mode_source: ModeSource,
    pub routing: ReconcileOutcome,
    /// Backend output of the `started` step, verbatim.
    pub output: BackendOutput,
    pub elapsed_ms: u64,
}
