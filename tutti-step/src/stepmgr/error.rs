/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the step manager.
//!
//! Every failure the core can return is a distinct [`StepError`] variant so
//! the RPC layer can map it without string matching.  The
//! *config-unavailable* / *nodes-busy* / *node-not-avail* trichotomy is
//! load-bearing: upstream retry logic keys off [`StepError::is_retryable`].
//!
//! Every error returned from step creation leaves the registry and the
//! accounting state exactly as they were.

use thiserror::Error;

/// Typed failures returned by the step manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// No job with the requested id exists.
    #[error("invalid job id")]
    InvalidJobId,

    /// The job exists but has no step with the requested id.
    #[error("invalid step id")]
    InvalidStepId,

    /// Caller is not the job owner (and not privileged).
    #[error("access denied")]
    AccessDenied,

    /// Request arrived from a uid that is neither the job owner nor a
    /// controller-trusted user.
    #[error("user id missing or not authorized")]
    UserIdMissing,

    /// The step or job is already past its terminal state.
    #[error("already done")]
    AlreadyDone,

    /// Step creation against a still-pending job allocation.
    #[error("duplicate job id (job allocation still pending)")]
    DuplicateJobId,

    /// The job is suspended or lacks its detail record.
    #[error("job is disabled (suspended or incomplete)")]
    Disabled,

    /// Operation requires a job that has left the pending state.
    #[error("job is pending")]
    JobPending,

    /// Signal sent to a job that is not running.
    #[error("job state transition does not permit this update")]
    TransitionStateNoUpdate,

    /// `max_nodes` is non-zero and below `min_nodes`.
    #[error("invalid node count ({min_nodes}-{max_nodes})")]
    InvalidNodeCount { min_nodes: u32, max_nodes: u32 },

    /// `num_tasks` is zero or exceeds `picked_nodes × max_tasks_per_node`.
    #[error("invalid task count")]
    BadTaskCount,

    /// Unknown task distribution policy.
    #[error("invalid task distribution")]
    BadDistribution,

    /// The configured switch fabric cannot run an arbitrary task layout.
    #[error("arbitrary task distribution not supported by switch type")]
    TaskdistArbitraryUnsupported,

    /// The request can never be satisfied from this job's allocation;
    /// retrying will not help.
    #[error("requested node configuration is not available")]
    ConfigUnavailable,

    /// Resources are held by other steps right now; retry may help.
    #[error("requested nodes are busy")]
    NodesBusy,

    /// A node of the job's allocation is down or not responding.
    #[error("required node not available")]
    NodeNotAvail,

    /// The job's prolog is still running; the first step must wait.
    #[error("job prolog is still running")]
    PrologRunning,

    /// Memory constraints make the request unsatisfiable.
    #[error("step memory limit cannot be satisfied")]
    InvalidTaskMemory,

    /// Generic-resource constraints make the request unsatisfiable.
    #[error("step generic resource request is invalid")]
    InvalidGres,

    /// `cpu_count` exceeds what the allocation can ever provide.
    #[error("more processors requested than permitted")]
    TooManyRequestedCpus,

    /// `next_step_id` reached the reserved sentinel range.
    #[error("step id limit reached for this job")]
    TooManySteps,

    /// A request string exceeds its per-field maximum.
    #[error("string '{field}' too long ({len} > {max})")]
    PathnameTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Step time limit is not acceptable.
    #[error("invalid step time limit")]
    InvalidTimeLimit,

    /// The switch plugin failed to build the step's fabric state.
    #[error("interconnect failure")]
    InterconnectFailure,

    /// Partial-completion node range is malformed for this step.
    #[error("invalid completion node range {first}-{last} (step has {nodes} nodes)")]
    InvalidNodeRange { first: u32, last: u32, nodes: u32 },
}

impl StepError {
    /// True for transient failures where the same request may succeed once
    /// other steps release resources.  Permanent failures should not be
    /// retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::NodesBusy | StepError::PrologRunning)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
