/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Consumed plugin contracts.
//!
//! The step manager depends on these capabilities, never on their
//! implementations.  Each category ships a `No*` implementation standing in
//! for a "none" plugin, and capability queries (e.g.
//! [`SwitchPlugin::part_comp`]) must be asked before assuming behaviour.
//!
//! The original passed opaque jobinfo pointers around; here the token types
//! ([`SwitchJob`], [`CheckJob`], [`StepGres`]) identify the (job, step) the
//! plugin should key its internal state by.  Implementations needing
//! mutable state use interior mutability — trait methods take `&self`
//! because they are called with the job-write lock already held.

use crate::stepmgr::error::StepError;

// ── Switch fabric ─────────────────────────────────────────────────────────────

/// Opaque handle for a step's switch-fabric state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchJob {
    pub job_id: u32,
    pub step_id: u32,
}

/// Interconnect plugin tracking per-step network state.
pub trait SwitchPlugin: Send + Sync {
    /// Does this fabric support releasing windows node-by-node?
    fn part_comp(&self) -> bool;

    fn alloc_jobinfo(&self, job_id: u32, step_id: u32) -> SwitchJob;

    fn build_jobinfo(
        &self,
        job: &SwitchJob,
        node_list: &str,
        tasks: &[u32],
        cyclic: bool,
        network: Option<&str>,
    ) -> Result<(), StepError>;

    /// The whole step is done; release every window.
    fn job_step_complete(&self, job: &SwitchJob, node_list: &str);

    /// Release windows on a subset of the step's nodes.
    fn job_step_part_comp(&self, job: &SwitchJob, node_list: &str);

    /// Told on state recovery that the step exists on these nodes.
    fn job_step_allocated(&self, job: &SwitchJob, node_list: Option<&str>);

    fn free_jobinfo(&self, job: SwitchJob);
}

/// "switch/none" — no fabric state to manage.
#[derive(Debug, Default)]
pub struct NoSwitch;

impl SwitchPlugin for NoSwitch {
    fn part_comp(&self) -> bool {
        false
    }

    fn alloc_jobinfo(&self, job_id: u32, step_id: u32) -> SwitchJob {
        SwitchJob { job_id, step_id }
    }

    fn build_jobinfo(
        &self,
        _job: &SwitchJob,
        _node_list: &str,
        _tasks: &[u32],
        _cyclic: bool,
        _network: Option<&str>,
    ) -> Result<(), StepError> {
        Ok(())
    }

    fn job_step_complete(&self, _job: &SwitchJob, _node_list: &str) {}

    fn job_step_part_comp(&self, _job: &SwitchJob, _node_list: &str) {}

    fn job_step_allocated(&self, _job: &SwitchJob, _node_list: Option<&str>) {}

    fn free_jobinfo(&self, _job: SwitchJob) {}
}

// ── Checkpoint ────────────────────────────────────────────────────────────────

/// Opaque handle for a step's checkpoint state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckJob {
    pub job_id: u32,
    pub step_id: u32,
}

/// Checkpoint operation requested of the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CkptOp {
    Able,
    Disable,
    Enable,
    Create,
    Vacate,
    Restart,
    Error,
}

/// Plugin reply for operations that report back to the requester.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CkptResponse {
    pub event_time: u64,
    pub error_code: u32,
    pub error_msg: String,
}

pub trait CheckpointPlugin: Send + Sync {
    /// False when "checkpoint/none" is configured; the periodic sweep exits
    /// immediately in that case.
    fn enabled(&self) -> bool;

    fn alloc_jobinfo(&self, job_id: u32, step_id: u32) -> CheckJob;

    fn free_jobinfo(&self, job: CheckJob);

    fn op(
        &self,
        job: &CheckJob,
        op: CkptOp,
        data: u16,
        image_dir: &str,
        now: u64,
    ) -> Result<CkptResponse, StepError>;

    fn comp(
        &self,
        job: &CheckJob,
        begin_time: u64,
        error_code: u32,
        error_msg: &str,
    ) -> Result<(), StepError>;

    fn task_comp(
        &self,
        job: &CheckJob,
        task_id: u32,
        begin_time: u64,
        error_code: u32,
        error_msg: &str,
    ) -> Result<(), StepError>;
}

/// "checkpoint/none".
#[derive(Debug, Default)]
pub struct NoCheckpoint;

impl CheckpointPlugin for NoCheckpoint {
    fn enabled(&self) -> bool {
        false
    }

    fn alloc_jobinfo(&self, job_id: u32, step_id: u32) -> CheckJob {
        CheckJob { job_id, step_id }
    }

    fn free_jobinfo(&self, _job: CheckJob) {}

    fn op(
        &self,
        _job: &CheckJob,
        _op: CkptOp,
        _data: u16,
        _image_dir: &str,
        now: u64,
    ) -> Result<CkptResponse, StepError> {
        Ok(CkptResponse {
            event_time: now,
            ..CkptResponse::default()
        })
    }

    fn comp(
        &self,
        _job: &CheckJob,
        _begin_time: u64,
        _error_code: u32,
        _error_msg: &str,
    ) -> Result<(), StepError> {
        Ok(())
    }

    fn task_comp(
        &self,
        _job: &CheckJob,
        _task_id: u32,
        _begin_time: u64,
        _error_code: u32,
        _error_msg: &str,
    ) -> Result<(), StepError> {
        Ok(())
    }
}

// ── Generic resources ─────────────────────────────────────────────────────────

/// Validated step-level GRES request handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepGres {
    pub job_id: u32,
    /// The validated request specification, e.g. `"gpu:2"`.
    pub spec: String,
}

/// Per-node generic-resource accounting, owned entirely by the plugin.
pub trait GresPlugin: Send + Sync {
    /// Validate a step GRES request against the job's GRES pool.
    ///
    /// `Ok(None)` when the step requests no generic resources.
    fn step_state_validate(
        &self,
        spec: Option<&str>,
        job_id: u32,
    ) -> Result<Option<StepGres>, StepError>;

    /// How many CPU-equivalents of this step's GRES request node
    /// `node_inx` (job-local index) can supply.  `u32::MAX` when GRES does
    /// not constrain the node.  `ignore_alloc` ignores live-step debits
    /// ("total"); otherwise they are honoured ("avail").
    fn step_test(
        &self,
        step_gres: Option<&StepGres>,
        node_inx: usize,
        ignore_alloc: bool,
        job_id: u32,
        step_id: Option<u32>,
    ) -> u32;

    fn step_alloc(&self, step_gres: &StepGres, node_inx: usize, cpus: u32, step_id: u32);

    fn step_dealloc(&self, step_gres: &StepGres, step_id: u32);

    fn step_state_log(&self, _step_gres: Option<&StepGres>, _job_id: u32, _step_id: u32) {}
}

/// No GRES plugin loaded: requesting generic resources is invalid and no
/// node is ever GRES-constrained.
#[derive(Debug, Default)]
pub struct NoGres;

impl GresPlugin for NoGres {
    fn step_state_validate(
        &self,
        spec: Option<&str>,
        _job_id: u32,
    ) -> Result<Option<StepGres>, StepError> {
        match spec {
            None => Ok(None),
            Some(s) if s.is_empty() => Ok(None),
            Some(_) => Err(StepError::InvalidGres),
        }
    }

    fn step_test(
        &self,
        _step_gres: Option<&StepGres>,
        _node_inx: usize,
        _ignore_alloc: bool,
        _job_id: u32,
        _step_id: Option<u32>,
    ) -> u32 {
        u32::MAX
    }

    fn step_alloc(&self, _step_gres: &StepGres, _node_inx: usize, _cpus: u32, _step_id: u32) {}

    fn step_dealloc(&self, _step_gres: &StepGres, _step_id: u32) {}
}

// ── Accounting storage ────────────────────────────────────────────────────────

pub trait AcctStorage: Send + Sync {
    /// Idempotent: called when a job first reaches the database.
    fn job_start(&self, job_id: u32);

    fn step_start(&self, job_id: u32, step_id: u32);

    fn step_complete(&self, job_id: u32, step_id: u32, exit_code: u32);
}

#[derive(Debug, Default)]
pub struct NoAcct;

impl AcctStorage for NoAcct {
    fn job_start(&self, _job_id: u32) {}
    fn step_start(&self, _job_id: u32, _step_id: u32) {}
    fn step_complete(&self, _job_id: u32, _step_id: u32, _exit_code: u32) {}
}

// ── Agent dispatch ────────────────────────────────────────────────────────────

/// Outbound RPC queued to the agent's thread pool.  The caller does not
/// wait for delivery; there is no inter-node ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    /// Deliver a signal to a step's tasks on every listed node.
    SignalTasks {
        job_id: u32,
        step_id: u32,
        signal: u16,
        nodes: Vec<String>,
    },
    /// Terminate a step's tasks on every listed node.
    TerminateTasks {
        job_id: u32,
        step_id: u32,
        signal: u16,
        nodes: Vec<String>,
    },
    /// The step exceeded its time limit.
    KillTimeLimit {
        job_id: u32,
        step_id: u32,
        nodes: Vec<String>,
    },
    /// Tell the launcher endpoint its step is complete.
    LauncherStepComplete {
        job_id: u32,
        step_id: u32,
        host: Option<String>,
        port: u16,
    },
}

pub trait AgentDispatch: Send + Sync {
    fn queue(&self, msg: AgentMessage);
}

/// Discards messages (single-node / test deployments).
#[derive(Debug, Default)]
pub struct NoAgent;

impl AgentDispatch for NoAgent {
    fn queue(&self, msg: AgentMessage) {
        tracing::debug!(?msg, "agent message dropped (no agent configured)");
    }
}

// ── Plugin bundle ─────────────────────────────────────────────────────────────

/// Every plugin the step manager consumes, behind trait objects.
pub struct Plugins {
    pub switch: Box<dyn SwitchPlugin>,
    pub checkpoint: Box<dyn CheckpointPlugin>,
    pub gres: Box<dyn GresPlugin>,
    pub acct: Box<dyn AcctStorage>,
    pub agent: Box<dyn AgentDispatch>,
}

impl Default for Plugins {
    fn default() -> Self {
        Self {
            switch: Box::new(NoSwitch),
            checkpoint: Box::new(NoCheckpoint),
            gres: Box::new(NoGres),
            acct: Box::new(NoAcct),
            agent: Box::new(NoAgent),
        }
    }
}

impl std::fmt::Debug for Plugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugins").finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_gres_rejects_requests_and_never_constrains() {
        let gres = NoGres;
        assert!(gres.step_state_validate(None, 1).unwrap().is_none());
        assert!(gres.step_state_validate(Some(""), 1).unwrap().is_none());
        assert_eq!(
            gres.step_state_validate(Some("gpu:2"), 1),
            Err(StepError::InvalidGres)
        );
        assert_eq!(gres.step_test(None, 0, true, 1, None), u32::MAX);
    }

    #[test]
    fn no_switch_has_no_partial_release() {
        assert!(!NoSwitch.part_comp());
    }

    #[test]
    fn no_checkpoint_is_disabled() {
        assert!(!NoCheckpoint.enabled());
    }
}
