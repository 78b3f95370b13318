/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Step-side data model: the create request, the task-distribution policy,
//! the computed layout, and the step record itself.

use crate::bitmap::Bitmap;
use crate::plugins::{CheckJob, StepGres, SwitchJob};
use crate::ALL_NODES;

// ── Task distribution ─────────────────────────────────────────────────────────

/// Task distribution policy for a step.
///
/// The second half of the compound policies (`Cyclic×Block` etc.) steers
/// in-node CPU binding and is consumed by the node daemons; at the
/// controller level only the node-level half matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskDist {
    Cyclic,
    #[default]
    Block,
    CyclicCyclic,
    BlockCyclic,
    CyclicBlock,
    BlockBlock,
    Plane,
    /// Caller-supplied node list is honoured verbatim, duplicates included.
    Arbitrary,
}

impl TaskDist {
    /// Whether the fabric should be told this is a cyclic allocation.
    pub fn cyclic_alloc(self) -> bool {
        matches!(
            self,
            TaskDist::Cyclic | TaskDist::CyclicCyclic | TaskDist::CyclicBlock
        )
    }

    /// The node-level half of the policy: cyclic-style round-robin or
    /// block-style fill.
    pub fn node_level_cyclic(self) -> bool {
        self.cyclic_alloc()
    }
}

// ── Step layout ───────────────────────────────────────────────────────────────

/// Tasks → nodes mapping produced by the layout component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLayout {
    /// Comma-separated names of the step's nodes, bit-index ascending (or
    /// verbatim caller order for arbitrary distribution).
    pub node_list: String,
    pub node_cnt: u32,
    /// Task count per step node (step-local index).
    pub tasks: Vec<u32>,
    pub task_cnt: u32,
}

// ── Accounting delta ──────────────────────────────────────────────────────────

/// Minimal resource-usage delta reported by a stepd with a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobacctDelta {
    pub user_cpu_sec: u64,
    pub sys_cpu_sec: u64,
    pub max_rss_mb: u64,
}

impl JobacctDelta {
    /// Fold another node's usage into this aggregate: CPU times add, peak
    /// memory takes the maximum.
    pub fn aggregate(&mut self, other: &JobacctDelta) {
        self.user_cpu_sec += other.user_cpu_sec;
        self.sys_cpu_sec += other.sys_cpu_sec;
        self.max_rss_mb = self.max_rss_mb.max(other.max_rss_mb);
    }
}

// ── Step create request ───────────────────────────────────────────────────────

/// A decoded step-creation request.  RPC decoding and authentication happen
/// upstream; the manager sees typed arguments only.
#[derive(Debug, Clone)]
pub struct StepCreateRequest {
    pub job_id: u32,
    pub user_id: u32,
    /// [`ALL_NODES`] = every node of the job's allocation.
    pub min_nodes: u32,
    /// 0 = no upper bound.
    pub max_nodes: u32,
    pub num_tasks: Option<u32>,
    pub cpu_count: Option<u32>,
    /// MB per allocated CPU; 0 = no memory request.
    pub mem_per_cpu: u64,
    /// Offset into the job's available nodes; skips that many.
    pub relative: Option<u32>,
    pub task_dist: TaskDist,
    pub plane_size: u32,
    pub node_list: Option<String>,
    pub exclusive: bool,
    pub overcommit: bool,
    pub no_kill: bool,
    pub gres: Option<String>,
    /// Minutes; `None` = unlimited.
    pub time_limit: Option<u32>,
    /// Minutes; 0 = no periodic checkpoint.
    pub ckpt_interval: u16,
    pub ckpt_dir: Option<String>,
    /// `Some(0)` = auto: max per-node task count + 1.
    pub resv_port_cnt: Option<u16>,
    /// Launcher callback endpoint.
    pub host: Option<String>,
    pub port: u16,
    pub name: Option<String>,
    pub network: Option<String>,
}

impl Default for StepCreateRequest {
    fn default() -> Self {
        Self {
            job_id: 0,
            user_id: 0,
            min_nodes: 1,
            max_nodes: 0,
            num_tasks: None,
            cpu_count: None,
            mem_per_cpu: 0,
            relative: None,
            task_dist: TaskDist::default(),
            plane_size: 0,
            node_list: None,
            exclusive: false,
            overcommit: false,
            no_kill: false,
            gres: None,
            time_limit: None,
            ckpt_interval: 0,
            ckpt_dir: None,
            resv_port_cnt: None,
            host: None,
            port: 0,
            name: None,
            network: None,
        }
    }
}

impl StepCreateRequest {
    /// True when the request names every node of the job.
    pub fn wants_all_nodes(&self) -> bool {
        self.min_nodes == ALL_NODES
    }
}

// ── Step record ───────────────────────────────────────────────────────────────

/// A live step: a sub-allocation inside a job used to launch one parallel
/// task group.
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Unique within the job, strictly increasing in allocation order.
    pub step_id: u32,
    /// Subset of the job's nodes chosen for this step (cluster-indexed).
    pub step_node_bitmap: Bitmap,
    /// Cores this step took, indexed over the *job's* full core space.
    /// Absent for steps that use all of the job's cores (recorded
    /// implicitly) and on platforms without core accounting.
    pub core_bitmap_job: Option<Bitmap>,
    /// 0 = unspecified (the request's CPU count did not divide evenly over
    /// its tasks).
    pub cpus_per_task: u32,
    /// The CPU count as originally requested.
    pub cpu_count: u32,
    pub mem_per_cpu: u64,
    pub exclusive: bool,
    pub no_kill: bool,
    pub cyclic_alloc: bool,
    pub batch_step: bool,
    /// Absent for batch steps.
    pub step_layout: Option<StepLayout>,
    /// The step's GRES request string, as submitted.
    pub gres: Option<String>,
    /// Validated GRES debit handle.
    pub gres_handle: Option<StepGres>,
    /// Which step nodes reported completion, indexed 0..step-node-count
    /// (*step-local*, not cluster index).  Allocated on the first partial
    /// completion report.
    pub exit_node_bitmap: Option<Bitmap>,
    /// Highest return code seen across completions; `None` until the first
    /// report.
    pub exit_code: Option<u32>,
    /// uid that requested the step be killed, if any.
    pub requid: Option<u32>,
    pub jobacct: JobacctDelta,
    pub start_time: u64,
    /// Run time banked before the current suspension.
    pub pre_sus_time: u64,
    /// Total seconds this step has spent suspended.
    pub tot_sus_time: u64,
    pub ckpt_time: u64,
    pub ckpt_interval: u16,
    pub ckpt_dir: Option<String>,
    /// Minutes; `None` = unlimited.
    pub time_limit: Option<u32>,
    pub resv_port_cnt: Option<u16>,
    pub host: Option<String>,
    pub port: u16,
    pub name: String,
    pub network: Option<String>,
    pub switch_job: Option<SwitchJob>,
    pub check_job: Option<CheckJob>,
}

impl StepRecord {
    /// Fresh record; everything beyond identity, start time, and placement
    /// is filled in by the create path.
    pub fn new(step_id: u32, now: u64, step_node_bitmap: Bitmap) -> Self {
        Self {
            step_id,
            step_node_bitmap,
            core_bitmap_job: None,
            cpus_per_task: 0,
            cpu_count: 0,
            mem_per_cpu: 0,
            exclusive: false,
            no_kill: false,
            cyclic_alloc: false,
            batch_step: false,
            step_layout: None,
            gres: None,
            gres_handle: None,
            exit_node_bitmap: None,
            exit_code: None,
            requid: None,
            jobacct: JobacctDelta::default(),
            start_time: now,
            pre_sus_time: 0,
            tot_sus_time: 0,
            ckpt_time: now,
            ckpt_interval: 0,
            ckpt_dir: None,
            time_limit: None,
            resv_port_cnt: None,
            host: None,
            port: 0,
            name: String::new(),
            network: None,
            switch_job: None,
            check_job: None,
        }
    }

    /// Number of nodes in this step.
    pub fn node_cnt(&self) -> u32 {
        self.step_node_bitmap.count() as u32
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
