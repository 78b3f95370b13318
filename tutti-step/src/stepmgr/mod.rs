/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The step manager: admission, placement, accounting, and lifecycle of
//! job steps.
//!
//! [`StepMgr`] owns the job table, the configuration, the plugin bundle,
//! and the rotating core-oversubscription bias — the initialization-once
//! context that replaces the original's process globals.  Every mutation
//! goes through `&mut self`, so operations are linearizable with respect
//! to the registries once the caller wraps the manager in its job-write
//! lock.
//!
//! Control flow for a step creation: validate inputs → pick nodes against
//! the live debit counters → build the per-node task layout → debit CPUs,
//! memory, and cores → insert into the registry.  Completion reverses the
//! debits under the same invariants.  Every error leaves registry and
//! accounting exactly as they were.

pub mod alloc;
pub mod error;
pub mod layout;
pub mod picker;
pub mod snapshot;

pub use error::StepError;

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use crate::bitmap::Bitmap;
use crate::cluster::NodeInventory;
use crate::config::{ArbitraryDistPolicy, StepmgrConfig};
use crate::job::JobRecord;
use crate::plugins::{AgentMessage, CkptOp, CkptResponse, Plugins};
use crate::step::{JobacctDelta, StepCreateRequest, StepRecord, TaskDist};
use crate::{BATCH_SCRIPT_STEP_ID, MAX_STEP_ID};

use alloc::{step_alloc_lps, step_dealloc_lps};
use layout::{step_layout_create, LayoutParams};
use picker::{pick_step_nodes, PickSpec};

// ── Constants ─────────────────────────────────────────────────────────────────

pub const SIGKILL: u16 = 9;

/// Per-field maximum for request strings.
const MAX_STR_LEN: usize = 1024;
/// The node list may name many nodes.
const MAX_NODE_LIST_LEN: usize = 1024 * 64;

// ── Request / reply types ─────────────────────────────────────────────────────

/// Who is asking.  Decoded and authenticated upstream.
#[derive(Debug, Clone, Default)]
pub struct Viewer {
    pub uid: u32,
    pub operator: bool,
    /// Accounts this user coordinates.
    pub coord_accounts: Vec<String>,
}

impl Viewer {
    fn privileged(&self) -> bool {
        self.uid == 0 || self.operator
    }

    fn coordinates(&self, account: &str) -> bool {
        !account.is_empty() && self.coord_accounts.iter().any(|a| a == account)
    }
}

/// A stepd's (possibly partial) completion report.  Range indices are
/// zero-origin into the step's node bitmap, not cluster indices.
#[derive(Debug, Clone)]
pub struct StepCompleteMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub range_first: u32,
    pub range_last: u32,
    pub step_rc: u32,
    pub jobacct: JobacctDelta,
}

/// Checkpoint operation request.
#[derive(Debug, Clone)]
pub struct CheckpointMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub op: CkptOp,
    pub data: u16,
    pub image_dir: Option<String>,
}

/// Filters for the step listing RPC.
#[derive(Debug, Clone, Default)]
pub struct StepInfoFilter {
    pub job_id: Option<u32>,
    pub step_id: Option<u32>,
    pub show_all: bool,
}

/// One step as reported to the listing RPC.
#[derive(Debug, Clone)]
pub struct StepInfo {
    pub job_id: u32,
    pub step_id: u32,
    pub user_id: u32,
    pub ckpt_interval: u16,
    pub cpu_count: u32,
    pub task_cnt: u32,
    pub time_limit: Option<u32>,
    pub start_time: u64,
    pub run_time: u64,
    pub partition: String,
    pub node_list: String,
    pub name: String,
    pub network: Option<String>,
    /// Step nodes in bitmap range format.
    pub node_inx: String,
    pub ckpt_dir: Option<String>,
    pub gres: Option<String>,
    pub resv_port_cnt: Option<u16>,
}

/// Which steps the job-shutdown path releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFilter {
    /// Delete every step.
    All,
    /// Delete only steps without a switch allocation.
    WithoutSwitch,
}

// ── StepMgr ───────────────────────────────────────────────────────────────────

/// The step placement and resource-accounting core.
pub struct StepMgr {
    config: StepmgrConfig,
    inventory: NodeInventory,
    plugins: Plugins,
    /// Jobs keyed by id; `BTreeMap` so sweeps iterate deterministically.
    jobs: BTreeMap<u32, JobRecord>,
    /// Rotating bias for the core oversubscription pass.  Affects fairness
    /// only, never correctness.
    last_core_inx: u32,
}

impl StepMgr {
    pub fn new(config: StepmgrConfig, inventory: NodeInventory, plugins: Plugins) -> Self {
        Self {
            config,
            inventory,
            plugins,
            jobs: BTreeMap::new(),
            last_core_inx: 0,
        }
    }

    pub fn config(&self) -> &StepmgrConfig {
        &self.config
    }

    pub fn inventory(&self) -> &NodeInventory {
        &self.inventory
    }

    /// Register a job allocation produced by the parent scheduler.
    pub fn insert_job(&mut self, job: JobRecord) {
        self.jobs.insert(job.job_id, job);
    }

    pub fn remove_job(&mut self, job_id: u32) -> Option<JobRecord> {
        self.jobs.remove(&job_id)
    }

    pub fn job(&self, job_id: u32) -> Option<&JobRecord> {
        self.jobs.get(&job_id)
    }

    pub fn job_mut(&mut self, job_id: u32) -> Option<&mut JobRecord> {
        self.jobs.get_mut(&job_id)
    }

    pub fn find_step(&self, job_id: u32, step_id: Option<u32>) -> Option<&StepRecord> {
        self.jobs.get(&job_id)?.find_step(step_id)
    }

    // ── Step creation ─────────────────────────────────────────────────────────

    /// Create a step inside `req.job_id`'s allocation and return its id.
    ///
    /// Rollback is explicit: any failure after validation leaves the
    /// registry and the debit counters untouched.
    pub fn step_create(
        &mut self,
        mut req: StepCreateRequest,
        batch_step: bool,
        now: u64,
    ) -> Result<u32, StepError> {
        debug!(
            job_id = req.job_id,
            user_id = req.user_id,
            min_nodes = req.min_nodes,
            max_nodes = req.max_nodes,
            num_tasks = ?req.num_tasks,
            cpu_count = ?req.cpu_count,
            mem_per_cpu = req.mem_per_cpu,
            task_dist = ?req.task_dist,
            node_list = ?req.node_list,
            exclusive = req.exclusive,
            overcommit = req.overcommit,
            "step create request"
        );

        let job = self.jobs.get_mut(&req.job_id).ok_or(StepError::InvalidJobId)?;

        if job.is_suspended() {
            return Err(StepError::Disabled);
        }
        if job.is_pending() {
            // an allocation that has not started cannot host steps
            return Err(StepError::DuplicateJobId);
        }
        if req.user_id != job.user_id {
            return Err(StepError::AccessDenied);
        }
        if batch_step {
            info!(
                user_id = req.user_id,
                job_id = req.job_id,
                "user attempting to run a batch script within an existing job"
            );
        }
        if job.is_finished() || job.end_time <= now {
            return Err(StepError::AlreadyDone);
        }

        if req.task_dist == TaskDist::Plane && req.plane_size == 0 {
            return Err(StepError::BadDistribution);
        }
        if req.task_dist == TaskDist::Arbitrary
            && self.config.arbitrary_dist == ArbitraryDistPolicy::Unsupported
        {
            return Err(StepError::TaskdistArbitraryUnsupported);
        }

        test_strlen(req.ckpt_dir.as_deref(), "ckpt_dir", MAX_STR_LEN)?;
        test_strlen(req.gres.as_deref(), "gres", MAX_STR_LEN)?;
        test_strlen(req.host.as_deref(), "host", MAX_STR_LEN)?;
        test_strlen(req.name.as_deref(), "name", MAX_STR_LEN)?;
        test_strlen(req.network.as_deref(), "network", MAX_STR_LEN)?;
        test_strlen(req.node_list.as_deref(), "node_list", MAX_NODE_LIST_LEN)?;

        // memory accounting is a no-op unless memory is a reserved resource
        if !self.config.mem_reserved {
            req.mem_per_cpu = 0;
        }

        let orig_cpu_count = req.cpu_count.unwrap_or(0);
        if req.overcommit {
            if req.exclusive {
                // not a legitimate combination; exclusively allocate one
                // CPU per task instead
                req.overcommit = false;
                req.cpu_count = req.num_tasks;
            } else {
                // no CPU availability check at all
                req.cpu_count = None;
            }
        }

        if req.num_tasks == Some(0) {
            return Err(StepError::BadTaskCount);
        }

        // reverse what the launcher did; 0 when the CPU count cannot be
        // spread evenly over the tasks (heterogeneous request)
        let cpus_per_task = match (req.cpu_count, req.num_tasks) {
            (Some(cc), Some(nt)) if cc > 0 && nt > 0 && cc % nt == 0 => (cc / nt).max(1),
            _ => 0,
        };

        let step_gres = self
            .plugins
            .gres
            .step_state_validate(req.gres.as_deref(), req.job_id)?;

        let mut pick = PickSpec {
            min_nodes: req.min_nodes,
            max_nodes: req.max_nodes,
            num_tasks: req.num_tasks.unwrap_or(0),
            cpu_count: req.cpu_count.unwrap_or(0),
            mem_per_cpu: req.mem_per_cpu,
            node_list: req.node_list.clone(),
            relative: req.relative,
            task_dist: req.task_dist,
            exclusive: req.exclusive,
        };
        let outcome = pick_step_nodes(
            job,
            &mut pick,
            step_gres.as_ref(),
            cpus_per_task,
            &self.inventory,
            &self.config,
            self.plugins.gres.as_ref(),
            now,
        )?;
        let nodeset = outcome.picked;
        let node_count = nodeset.count() as u32;
        // the picker may have rewritten these
        req.task_dist = pick.task_dist;
        req.node_list = pick.node_list.clone();
        req.mem_per_cpu = pick.mem_per_cpu;

        let num_tasks = match req.num_tasks {
            Some(nt) => nt,
            None => match req.cpu_count {
                Some(cc) if cc > 0 => cc,
                _ => node_count,
            },
        };
        if num_tasks == 0 {
            return Err(StepError::BadTaskCount);
        }
        if num_tasks > node_count.saturating_mul(self.config.max_tasks_per_node) {
            error!(num_tasks, node_count, "step has invalid task count");
            return Err(StepError::BadTaskCount);
        }

        if job.next_step_id >= MAX_STEP_ID {
            // keep sentinel ids out of the accounting database
            info!(job_id = job.job_id, "job has reached its step id limit");
            return Err(StepError::TooManySteps);
        }
        let step_id = job.next_step_id;
        job.next_step_id += 1;

        let mut step = StepRecord::new(step_id, now, nodeset.clone());

        // the node list is set here: arbitrary keeps the caller's order
        let step_node_list = match (&req.node_list, req.task_dist) {
            (Some(list), TaskDist::Arbitrary) => {
                let list = list.clone();
                req.node_list = Some(self.inventory.bitmap_to_names(&nodeset));
                list
            }
            _ => {
                let names = self.inventory.bitmap_to_names(&nodeset);
                req.node_list = Some(names.clone());
                names
            }
        };
        debug!(step_node_list = %step_node_list, node_count, "step node list set");

        step.cyclic_alloc = req.task_dist.cyclic_alloc();
        step.gres = req.gres.clone();
        step.gres_handle = step_gres;
        self.plugins
            .gres
            .step_state_log(step.gres_handle.as_ref(), job.job_id, step_id);

        step.port = req.port;
        step.host = req.host.clone();
        step.batch_step = batch_step;
        step.cpus_per_task = cpus_per_task;
        step.mem_per_cpu = req.mem_per_cpu;
        step.ckpt_interval = req.ckpt_interval;
        step.ckpt_time = now;
        step.cpu_count = orig_cpu_count;
        step.exclusive = req.exclusive;
        step.ckpt_dir = req.ckpt_dir.clone();
        step.no_kill = req.no_kill;

        // name and network default to the job's values
        step.name = match &req.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => job.name.clone(),
        };
        step.network = match &req.network {
            Some(net) if !net.is_empty() => Some(net.clone()),
            _ => job.network.clone(),
        };

        // recorded as submitted; the job's own limit cuts it short anyway
        step.time_limit = match req.time_limit {
            None | Some(0) => None,
            Some(minutes) => Some(minutes),
        };

        if !batch_step {
            let layout = step_layout_create(&LayoutParams {
                job: &*job,
                inventory: &self.inventory,
                gres: self.plugins.gres.as_ref(),
                mem_reserved: self.config.mem_reserved,
                step_node_bitmap: &nodeset,
                step_gres: step.gres_handle.as_ref(),
                exclusive: step.exclusive,
                mem_per_cpu: step.mem_per_cpu,
                cpus_per_task,
                step_id,
                node_list: &step_node_list,
                node_count,
                num_tasks,
                task_dist: req.task_dist,
                plane_size: req.plane_size,
            })
            .map_err(|e| {
                if e == StepError::ConfigUnavailable && step.mem_per_cpu > 0 {
                    StepError::InvalidTaskMemory
                } else {
                    e
                }
            })?;

            // reserved port count of 0 means "auto": the maximum per-node
            // task count plus one
            if let Some(cnt) = req.resv_port_cnt {
                let cnt = if cnt == 0 {
                    layout.tasks.iter().copied().max().unwrap_or(0) as u16 + 1
                } else {
                    cnt
                };
                step.resv_port_cnt = Some(cnt);
            }

            let switch_job = self.plugins.switch.alloc_jobinfo(job.job_id, step_id);
            if let Err(e) = self.plugins.switch.build_jobinfo(
                &switch_job,
                &layout.node_list,
                &layout.tasks,
                step.cyclic_alloc,
                step.network.as_deref(),
            ) {
                error!(job_id = job.job_id, step_id, ?e, "switch build_jobinfo failed");
                self.plugins.switch.free_jobinfo(switch_job);
                return Err(StepError::InterconnectFailure);
            }
            step.switch_job = Some(switch_job);
            step.step_layout = Some(layout);

            step_alloc_lps(
                job,
                &mut step,
                self.config.mem_reserved,
                self.plugins.gres.as_ref(),
                &mut self.last_core_inx,
            );
        }

        step.check_job = Some(self.plugins.checkpoint.alloc_jobinfo(job.job_id, step_id));

        let job_id = job.job_id;
        job.steps.push(step);
        info!(job_id, step_id, nodes = %step_node_list, "step created");

        self.plugins.acct.job_start(job_id);
        self.plugins.acct.step_start(job_id, step_id);
        Ok(step_id)
    }

    // ── Signals ───────────────────────────────────────────────────────────────

    /// Signal every task of a step.
    pub fn job_step_signal(
        &mut self,
        job_id: u32,
        step_id: u32,
        signal: u16,
        uid: u32,
    ) -> Result<(), StepError> {
        let job = self.jobs.get_mut(&job_id).ok_or_else(|| {
            error!(job_id, "step signal for invalid job id");
            StepError::InvalidJobId
        })?;
        if job.is_finished() {
            return Err(StepError::AlreadyDone);
        }
        if !job.is_running() {
            debug!(job_id, step_id, signal, state = ?job.state, "cannot signal step in this job state");
            return Err(StepError::TransitionStateNoUpdate);
        }
        if job.user_id != uid && uid != 0 {
            error!(uid, job_id, "security violation: step signal from wrong uid");
            return Err(StepError::UserIdMissing);
        }
        let front_end = self.config.front_end;
        let batch_host = job.batch_host.clone();
        let step = job
            .find_step_mut(Some(step_id))
            .ok_or(StepError::InvalidStepId)?;

        if signal == SIGKILL {
            // remember who asked for the kill, and tell the launcher
            step.requid = Some(uid);
            self.plugins.agent.queue(AgentMessage::LauncherStepComplete {
                job_id,
                step_id,
                host: step.host.clone(),
                port: step.port,
            });
        }

        let nodes = signal_target_nodes(&self.inventory, front_end, &batch_host, step);
        if nodes.is_empty() {
            return Ok(());
        }
        self.plugins.agent.queue(AgentMessage::SignalTasks {
            job_id,
            step_id,
            signal,
            nodes,
        });
        Ok(())
    }

    /// Signal a step's tasks on a single node.
    pub fn signal_step_on_node(
        &self,
        job_id: u32,
        step_id: u32,
        node_name: &str,
        signal: u16,
    ) -> Result<(), StepError> {
        let job = self.jobs.get(&job_id).ok_or(StepError::InvalidJobId)?;
        let step = job.find_step(Some(step_id)).ok_or(StepError::InvalidStepId)?;
        let node = match (&self.config.front_end, &job.batch_host) {
            (true, Some(host)) => host.clone(),
            _ => node_name.to_string(),
        };
        self.plugins.agent.queue(AgentMessage::SignalTasks {
            job_id,
            step_id: step.step_id,
            signal,
            nodes: vec![node],
        });
        Ok(())
    }

    /// Kill every step of `job_id` that touches `node_name` (unless the
    /// step asked not to be killed on node failure).  Returns the number of
    /// steps signalled.
    pub fn kill_step_on_node(&mut self, job_id: u32, node_name: &str) -> u32 {
        let Some(node_inx) = self.inventory.find(node_name) else {
            return 0;
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return 0;
        };
        let mut found = 0;
        for step in &job.steps {
            if step.no_kill || !step.step_node_bitmap.test(node_inx) {
                continue;
            }
            info!(
                job_id,
                step_id = step.step_id,
                node = node_name,
                "killing step on failed node"
            );
            self.plugins.agent.queue(AgentMessage::LauncherStepComplete {
                job_id,
                step_id: step.step_id,
                host: step.host.clone(),
                port: step.port,
            });
            self.plugins.agent.queue(AgentMessage::TerminateTasks {
                job_id,
                step_id: step.step_id,
                signal: SIGKILL,
                nodes: vec![node_name.to_string()],
            });
            found += 1;
        }
        found
    }

    // ── Completion ────────────────────────────────────────────────────────────

    /// Note normal completion of a step: final accounting, full resource
    /// release, registry removal.
    pub fn job_step_complete(
        &mut self,
        job_id: u32,
        step_id: u32,
        uid: u32,
        _requeue: bool,
        _job_return_code: u32,
    ) -> Result<(), StepError> {
        let job = self.jobs.get_mut(&job_id).ok_or_else(|| {
            info!(job_id, "step complete for invalid job id");
            StepError::InvalidJobId
        })?;
        if job.user_id != uid && uid != 0 {
            error!(uid, job_id, "security violation: step complete from wrong uid");
            return Err(StepError::UserIdMissing);
        }
        let Some(mut step) = job.remove_step(step_id) else {
            info!(job_id, step_id, "step complete: step not found");
            return Err(StepError::AlreadyDone);
        };

        let exit_code = step.exit_code.unwrap_or(0);
        self.plugins.acct.step_complete(job_id, step_id, exit_code);
        job.derived_ec = job.derived_ec.max(exit_code);

        step_dealloc_lps(job, &mut step, self.config.mem_reserved);
        if let Some(handle) = &step.gres_handle {
            self.plugins.gres.step_dealloc(handle, step_id);
        }
        release_step_plugins(&self.plugins, &mut step);
        info!(job_id, step_id, "step complete");
        Ok(())
    }

    /// Note the completion of a step on a range of its nodes.  Returns the
    /// count of nodes still pending and the highest return code seen.
    pub fn step_partial_comp(
        &mut self,
        req: &StepCompleteMsg,
        uid: u32,
    ) -> Result<(u32, u32), StepError> {
        let job = self.jobs.get_mut(&req.job_id).ok_or_else(|| {
            info!(job_id = req.job_id, "partial completion for invalid job id");
            StepError::InvalidJobId
        })?;
        if job.is_pending() {
            return Err(StepError::JobPending);
        }
        if uid != 0 && uid != job.user_id {
            // normally from a stepd, from the launcher on some failures
            error!(uid, job_id = req.job_id, "security violation: step completion rpc");
            return Err(StepError::UserIdMissing);
        }
        let step = job
            .find_step_mut(Some(req.step_id))
            .ok_or(StepError::InvalidStepId)?;

        if step.batch_step {
            // no layout and no bitmap; a single completion settles it, and
            // the record stays until the job completion path removes it
            step.exit_code = Some(req.step_rc);
            step.jobacct.aggregate(&req.jobacct);
            return Ok((0, req.step_rc));
        }

        let nodes = step.node_cnt();
        if req.range_last < req.range_first || req.range_last >= nodes {
            error!(
                job_id = req.job_id,
                step_id = req.step_id,
                range_first = req.range_first,
                range_last = req.range_last,
                nodes,
                "invalid completion range"
            );
            return Err(StepError::InvalidNodeRange {
                first: req.range_first,
                last: req.range_last,
                nodes,
            });
        }

        step.jobacct.aggregate(&req.jobacct);

        let rem = match &mut step.exit_node_bitmap {
            None => {
                // first report: size the bitmap to the step's node count
                let mut bm = Bitmap::new(nodes as usize);
                bm.set_range(req.range_first as usize, req.range_last as usize);
                let rem = bm.clear_count() as u32;
                step.exit_node_bitmap = Some(bm);
                step.exit_code = Some(req.step_rc);
                rem
            }
            Some(bm) => {
                bm.set_range(req.range_first as usize, req.range_last as usize);
                step.exit_code = Some(step.exit_code.unwrap_or(0).max(req.step_rc));
                bm.clear_count() as u32
            }
        };
        if rem == 0 {
            // release all switch windows
            if let Some(switch_job) = step.switch_job.take() {
                let node_list = step
                    .step_layout
                    .as_ref()
                    .map(|l| l.node_list.clone())
                    .unwrap_or_default();
                debug!(
                    job_id = req.job_id,
                    step_id = req.step_id,
                    nodes = %node_list,
                    "full switch release"
                );
                self.plugins.switch.job_step_complete(&switch_job, &node_list);
                self.plugins.switch.free_jobinfo(switch_job);
            }
        } else if self.plugins.switch.part_comp() {
            // release windows on the completed nodes; translate range
            // numbers to node names
            if let Some(switch_job) = &step.switch_job {
                let names = step_range_to_names(
                    &self.inventory,
                    step,
                    req.range_first,
                    req.range_last,
                );
                let node_list = names.join(",");
                debug!(
                    job_id = req.job_id,
                    step_id = req.step_id,
                    nodes = %node_list,
                    "partial switch release"
                );
                self.plugins.switch.job_step_part_comp(switch_job, &node_list);
            }
        }

        Ok((rem, step.exit_code.unwrap_or(0)))
    }

    /// A node finished its epilog: mark it complete in every step that still
    /// covers it and hand the name to the switch plugin's partial-release
    /// hook.  Returns the number of steps updated.
    pub fn step_epilog_complete(&mut self, job_id: u32, node_name: &str) -> u32 {
        if !self.plugins.switch.part_comp() {
            // fabric cannot release node-by-node
            return 0;
        }
        let Some(node_inx) = self.inventory.find(node_name) else {
            return 0;
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return 0;
        };
        let mut rc = 0;
        for step in &mut job.steps {
            if step.switch_job.is_none() || !step.step_node_bitmap.test(node_inx) {
                continue;
            }
            if let Some(exit_bm) = &mut step.exit_node_bitmap {
                // translate the cluster index to the step's local offset
                let Some(step_offset) = step.step_node_bitmap.position_of(node_inx) else {
                    continue;
                };
                if exit_bm.test(step_offset) {
                    continue; // already reported
                }
                exit_bm.set(step_offset);
            }
            rc += 1;
            debug!(
                job_id,
                step_id = step.step_id,
                node = node_name,
                "partial switch release on epilog"
            );
            if let Some(switch_job) = &step.switch_job {
                self.plugins.switch.job_step_part_comp(switch_job, node_name);
            }
        }
        rc
    }

    // ── Suspend / resume ──────────────────────────────────────────────────────

    /// Bank run time for every step of a job being suspended.
    pub fn suspend_job_steps(&mut self, job_id: u32, now: u64) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        for step in &mut job.steps {
            if job.suspend_time > 0 && job.suspend_time > step.start_time {
                step.pre_sus_time += now.saturating_sub(job.suspend_time);
            } else {
                step.pre_sus_time += now.saturating_sub(step.start_time);
            }
        }
    }

    /// Account suspended wall time for every step of a job being resumed.
    pub fn resume_job_steps(&mut self, job_id: u32, now: u64) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        for step in &mut job.steps {
            if job.suspend_time > 0 && job.suspend_time < step.start_time {
                step.tot_sus_time += now.saturating_sub(step.start_time);
            } else {
                step.tot_sus_time += now.saturating_sub(job.suspend_time);
            }
        }
    }

    // ── Periodic sweeps ───────────────────────────────────────────────────────

    /// Time-limit sweep: queue a TIMELIMIT message to every node of every
    /// expired step.  Resolution is one sweep interval; the step record
    /// stays until completion is reported.
    pub fn check_step_time_limits(&mut self, now: u64) {
        let front_end = self.config.front_end;
        for job in self.jobs.values_mut() {
            if !job.is_running() {
                continue;
            }
            for step in &job.steps {
                let Some(limit) = step.time_limit else {
                    continue;
                };
                let run_mins =
                    (now.saturating_sub(step.start_time).saturating_sub(step.tot_sus_time)) / 60;
                if run_mins >= limit as u64 {
                    info!(
                        job_id = job.job_id,
                        step_id = step.step_id,
                        time_limit = limit,
                        "step has timed out"
                    );
                    let nodes = signal_target_nodes(
                        &self.inventory,
                        front_end,
                        &job.batch_host,
                        step,
                    );
                    if nodes.is_empty() {
                        continue;
                    }
                    self.plugins.agent.queue(AgentMessage::KillTimeLimit {
                        job_id: job.job_id,
                        step_id: step.step_id,
                        nodes,
                    });
                }
            }
        }
    }

    /// Periodic checkpoint sweep (no-op when "checkpoint/none" is
    /// configured).  Batch jobs checkpoint at the job level; everything
    /// else checkpoints per step.  A step that just (re)started is skipped
    /// so a restart from checkpoint is not immediately re-checkpointed.
    pub fn step_checkpoint_sweep(&mut self, now: u64) {
        if !self.plugins.checkpoint.enabled() {
            return;
        }
        for job in self.jobs.values_mut() {
            if !job.is_running() {
                continue;
            }
            if job.batch_flag && job.ckpt_interval != 0 {
                let interval = job.ckpt_interval as u64 * 60;
                if job.ckpt_time + interval > now {
                    continue;
                }
                if job.start_time + interval > now {
                    // job started just now; may be restarting from its image
                    continue;
                }
                let check_job = self
                    .plugins
                    .checkpoint
                    .alloc_jobinfo(job.job_id, BATCH_SCRIPT_STEP_ID);
                let image_dir = ckpt_image_dir(
                    job.ckpt_dir.as_deref(),
                    job.job_id,
                    BATCH_SCRIPT_STEP_ID,
                );
                if let Err(e) =
                    self.plugins
                        .checkpoint
                        .op(&check_job, CkptOp::Create, 0, &image_dir, now)
                {
                    warn!(job_id = job.job_id, ?e, "batch checkpoint failed");
                }
                self.plugins.checkpoint.free_jobinfo(check_job);
                job.ckpt_time = now;
                continue; // ignore periodic step checkpoints
            }
            for step in &mut job.steps {
                if step.ckpt_interval == 0 {
                    continue;
                }
                let interval = step.ckpt_interval as u64 * 60;
                if step.ckpt_time + interval > now {
                    continue;
                }
                if step.start_time + interval > now {
                    // step restarted just now, likely from a checkpoint
                    continue;
                }
                step.ckpt_time = now;
                let image_dir =
                    ckpt_image_dir(step.ckpt_dir.as_deref(), job.job_id, step.step_id);
                let Some(check_job) = step.check_job.as_ref() else {
                    continue;
                };
                if let Err(e) =
                    self.plugins
                        .checkpoint
                        .op(check_job, CkptOp::Create, 0, &image_dir, now)
                {
                    warn!(
                        job_id = job.job_id,
                        step_id = step.step_id,
                        ?e,
                        "step checkpoint failed"
                    );
                }
            }
        }
    }

    // ── Checkpoint RPC family ─────────────────────────────────────────────────

    /// Perform a checkpoint operation on one step.
    pub fn job_step_checkpoint(
        &mut self,
        msg: &CheckpointMsg,
        uid: u32,
        now: u64,
    ) -> Result<CkptResponse, StepError> {
        let job = self.jobs.get(&msg.job_id).ok_or(StepError::InvalidJobId)?;
        if uid != job.user_id && uid != 0 {
            return Err(StepError::AccessDenied);
        }
        if job.is_pending() {
            return Err(StepError::JobPending);
        }
        if job.is_suspended() {
            // the job cannot get cycles for a checkpoint while suspended
            return Err(StepError::Disabled);
        }
        if !job.is_running() {
            return Err(StepError::AlreadyDone);
        }
        let step = job
            .find_step(Some(msg.step_id))
            .ok_or(StepError::InvalidStepId)?;
        let image_dir = match &msg.image_dir {
            Some(dir) => format!("{}/{}.{}", dir, msg.job_id, msg.step_id),
            None => ckpt_image_dir(step.ckpt_dir.as_deref(), msg.job_id, msg.step_id),
        };
        let check_job = step.check_job.as_ref().ok_or(StepError::InvalidStepId)?;
        self.plugins
            .checkpoint
            .op(check_job, msg.op, msg.data, &image_dir, now)
    }

    /// Note step checkpoint completion.
    pub fn job_step_checkpoint_comp(
        &mut self,
        job_id: u32,
        step_id: u32,
        uid: u32,
        begin_time: u64,
        error_code: u32,
        error_msg: &str,
    ) -> Result<(), StepError> {
        let step = self.checkpoint_comp_target(job_id, step_id, uid)?;
        let check_job = step.check_job.clone().ok_or(StepError::InvalidStepId)?;
        self.plugins
            .checkpoint
            .comp(&check_job, begin_time, error_code, error_msg)
    }

    /// Note task checkpoint completion.
    pub fn job_step_checkpoint_task_comp(
        &mut self,
        job_id: u32,
        step_id: u32,
        task_id: u32,
        uid: u32,
        begin_time: u64,
        error_code: u32,
        error_msg: &str,
    ) -> Result<(), StepError> {
        let step = self.checkpoint_comp_target(job_id, step_id, uid)?;
        let check_job = step.check_job.clone().ok_or(StepError::InvalidStepId)?;
        self.plugins
            .checkpoint
            .task_comp(&check_job, task_id, begin_time, error_code, error_msg)
    }

    fn checkpoint_comp_target(
        &self,
        job_id: u32,
        step_id: u32,
        uid: u32,
    ) -> Result<&StepRecord, StepError> {
        let job = self.jobs.get(&job_id).ok_or(StepError::InvalidJobId)?;
        if uid != job.user_id && uid != 0 {
            return Err(StepError::AccessDenied);
        }
        if job.is_pending() {
            return Err(StepError::JobPending);
        }
        if !job.is_running() && !job.is_suspended() {
            return Err(StepError::AlreadyDone);
        }
        job.find_step(Some(step_id)).ok_or(StepError::InvalidStepId)
    }

    // ── Updates ───────────────────────────────────────────────────────────────

    /// Change the time limit of one step (or of every step when `step_id`
    /// is `None`).
    pub fn update_step(
        &mut self,
        job_id: u32,
        step_id: Option<u32>,
        time_limit: Option<u32>,
        viewer: &Viewer,
    ) -> Result<(), StepError> {
        let job = self.jobs.get_mut(&job_id).ok_or_else(|| {
            error!(job_id, "step update for invalid job id");
            StepError::InvalidJobId
        })?;
        if job.user_id != viewer.uid && !viewer.privileged() && !viewer.coordinates(&job.account) {
            error!(uid = viewer.uid, job_id, "security violation: step update rpc");
            return Err(StepError::UserIdMissing);
        }
        if time_limit == Some(0) {
            return Err(StepError::InvalidTimeLimit);
        }

        // the job's own time limit caps every step regardless
        match step_id {
            None => {
                for step in &mut job.steps {
                    step.time_limit = time_limit;
                    info!(job_id, step_id = step.step_id, ?time_limit, "step time limit updated");
                }
            }
            Some(id) => {
                let step = job.find_step_mut(Some(id)).ok_or(StepError::InvalidStepId)?;
                step.time_limit = time_limit;
                info!(job_id, step_id = id, ?time_limit, "step time limit updated");
            }
        }
        Ok(())
    }

    // ── Listing ───────────────────────────────────────────────────────────────

    /// Step listing with the privacy rule: a job's steps are omitted when
    /// the caller is not the owner, an operator, or a coordinator of the
    /// job's account, or when the job's partition is hidden and show-all
    /// was not requested.
    pub fn step_info(
        &self,
        filter: &StepInfoFilter,
        viewer: &Viewer,
        now: u64,
    ) -> Result<Vec<StepInfo>, StepError> {
        let mut out = Vec::new();
        let mut valid_job = false;

        for job in self.jobs.values() {
            if let Some(job_id) = filter.job_id {
                if job.job_id != job_id {
                    continue;
                }
            }
            if !filter.show_all && job.partition_hidden {
                continue;
            }
            if self.config.private_jobs
                && job.user_id != viewer.uid
                && !viewer.privileged()
                && !viewer.coordinates(&job.account)
            {
                continue;
            }
            valid_job = true;

            for step in &job.steps {
                if let Some(step_id) = filter.step_id {
                    if step.step_id != step_id {
                        continue;
                    }
                }
                out.push(self.pack_step_info(job, step, now));
            }
        }

        if !self.jobs.is_empty() && !valid_job && out.is_empty() {
            return Err(StepError::InvalidJobId);
        }
        Ok(out)
    }

    fn pack_step_info(&self, job: &JobRecord, step: &StepRecord, now: u64) -> StepInfo {
        let (task_cnt, node_list) = match &step.step_layout {
            Some(layout) => (layout.task_cnt, layout.node_list.clone()),
            None => (
                job.resources.total_cpus(),
                self.inventory.bitmap_to_names(&job.node_bitmap),
            ),
        };
        let run_time = if job.is_suspended() {
            step.pre_sus_time
        } else {
            let begin = step.start_time.max(job.suspend_time);
            step.pre_sus_time + now.saturating_sub(begin)
        };
        StepInfo {
            job_id: job.job_id,
            step_id: step.step_id,
            user_id: job.user_id,
            ckpt_interval: step.ckpt_interval,
            cpu_count: step.cpu_count,
            task_cnt,
            time_limit: step.time_limit,
            start_time: step.start_time,
            run_time,
            partition: job.partition.clone(),
            node_list,
            name: step.name.clone(),
            network: step.network.clone(),
            node_inx: step.step_node_bitmap.to_range_fmt(),
            ckpt_dir: step.ckpt_dir.clone(),
            gres: step.gres.clone(),
            resv_port_cnt: step.resv_port_cnt,
        }
    }

    // ── Shutdown / teardown ───────────────────────────────────────────────────

    /// Job shutdown path: release every step (optionally keeping those
    /// with a live switch allocation for the fabric to drain first).
    pub fn delete_step_records(&mut self, job_id: u32, filter: DeleteFilter) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let steps = std::mem::take(&mut job.steps);
        for mut step in steps {
            if filter == DeleteFilter::WithoutSwitch && step.switch_job.is_some() {
                job.steps.push(step);
                continue;
            }
            release_step_plugins(&self.plugins, &mut step);
        }
    }

    // ── State snapshot ────────────────────────────────────────────────────────

    /// Serialize a job's step registry (in order) for restart.
    pub fn dump_job_steps(&self, job_id: u32) -> Result<String, snapshot::SnapshotError> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(snapshot::SnapshotError::UnknownJob(job_id))?;
        snapshot::dump_job_steps(job)
    }

    /// Rebuild a job's step registry from a snapshot produced by
    /// [`dump_job_steps`](Self::dump_job_steps).  Returns the number of
    /// steps recovered.
    pub fn load_job_steps(
        &mut self,
        job_id: u32,
        data: &str,
    ) -> Result<usize, snapshot::SnapshotError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(snapshot::SnapshotError::UnknownJob(job_id))?;
        snapshot::load_job_steps(job, data, &self.inventory, &self.plugins)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn test_strlen(value: Option<&str>, field: &'static str, max: usize) -> Result<(), StepError> {
    let len = value.map(str::len).unwrap_or(0);
    if len > max {
        info!(field, len, max, "step create request string too long");
        return Err(StepError::PathnameTooLong { field, len, max });
    }
    Ok(())
}

/// Nodes a step-directed message should address: the job's front-end host
/// on front-end systems, every step node otherwise.
fn signal_target_nodes(
    inventory: &NodeInventory,
    front_end: bool,
    batch_host: &Option<String>,
    step: &StepRecord,
) -> Vec<String> {
    if front_end {
        return batch_host.iter().cloned().collect();
    }
    inventory.names_of(&step.step_node_bitmap)
}

/// Names of the step's nodes with step-local index in `first..=last`.
fn step_range_to_names(
    inventory: &NodeInventory,
    step: &StepRecord,
    first: u32,
    last: u32,
) -> Vec<String> {
    step.step_node_bitmap
        .iter_set()
        .enumerate()
        .filter(|(step_inx, _)| *step_inx as u32 >= first && *step_inx as u32 <= last)
        .map(|(_, cluster_inx)| inventory.name(cluster_inx).to_string())
        .collect()
}

fn ckpt_image_dir(ckpt_dir: Option<&str>, job_id: u32, step_id: u32) -> String {
    match ckpt_dir {
        Some(dir) => format!("{}/{}.{}", dir, job_id, step_id),
        None => format!("{}.{}", job_id, step_id),
    }
}

/// Release a removed step's fabric and checkpoint state.
fn release_step_plugins(plugins: &Plugins, step: &mut StepRecord) {
    if let Some(switch_job) = step.switch_job.take() {
        let node_list = step
            .step_layout
            .as_ref()
            .map(|l| l.node_list.clone())
            .unwrap_or_default();
        plugins.switch.job_step_complete(&switch_job, &node_list);
        plugins.switch.free_jobinfo(switch_job);
    }
    if let Some(check_job) = step.check_job.take() {
        plugins.checkpoint.free_jobinfo(check_job);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::job::{JobResources, JobState};
    use crate::plugins::{GresPlugin, StepGres, SwitchJob, SwitchPlugin};

    // ── Recording plugin doubles ──────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingSwitch {
        events: Arc<Mutex<Vec<String>>>,
        supports_part_comp: bool,
    }

    impl SwitchPlugin for RecordingSwitch {
        fn part_comp(&self) -> bool {
            self.supports_part_comp
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
        fn job_step_complete(&self, job: &SwitchJob, node_list: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("complete:{}:{}", job.step_id, node_list));
        }
        fn job_step_part_comp(&self, job: &SwitchJob, node_list: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("part:{}:{}", job.step_id, node_list));
        }
        fn job_step_allocated(&self, _job: &SwitchJob, _node_list: Option<&str>) {}
        fn free_jobinfo(&self, _job: SwitchJob) {}
    }

    #[derive(Default)]
    struct RecordingAgent {
        msgs: Arc<Mutex<Vec<AgentMessage>>>,
    }

    impl crate::plugins::AgentDispatch for RecordingAgent {
        fn queue(&self, msg: AgentMessage) {
            self.msgs.lock().unwrap().push(msg);
        }
    }

    /// GRES plugin where every node offers the same CPU-equivalents:
    /// `total` ignoring live debits, `avail` honouring them.
    struct TightGres {
        total: u32,
        avail: u32,
    }

    impl GresPlugin for TightGres {
        fn step_state_validate(
            &self,
            spec: Option<&str>,
            job_id: u32,
        ) -> Result<Option<StepGres>, StepError> {
            Ok(spec.map(|s| StepGres {
                job_id,
                spec: s.to_string(),
            }))
        }
        fn step_test(
            &self,
            step_gres: Option<&StepGres>,
            _node_inx: usize,
            ignore_alloc: bool,
            _job_id: u32,
            _step_id: Option<u32>,
        ) -> u32 {
            if step_gres.is_none() {
                return u32::MAX;
            }
            if ignore_alloc {
                self.total
            } else {
                self.avail
            }
        }
        fn step_alloc(&self, _g: &StepGres, _node_inx: usize, _cpus: u32, _step_id: u32) {}
        fn step_dealloc(&self, _g: &StepGres, _step_id: u32) {}
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    /// 2-node cluster (n0, n1), 4 CPUs and 8 GB each, memory reserved;
    /// job 1 owned by uid 100, running.
    fn mgr() -> StepMgr {
        mgr_with(Plugins::default())
    }

    fn mgr_with(plugins: Plugins) -> StepMgr {
        let config = StepmgrConfig {
            mem_reserved: true,
            ..StepmgrConfig::default()
        };
        let inventory = NodeInventory::all_up(&["n0", "n1"]);
        let mut mgr = StepMgr::new(config, inventory, plugins);

        let mut bm = Bitmap::new(2);
        bm.set(0);
        bm.set(1);
        let resources = JobResources::new(bm, vec![4, 4], Some(vec![8192, 8192]), 1, 4);
        let mut job = JobRecord::new(1, 100, resources);
        job.next_step_id = 1; // boot guard exercised in picker tests
        mgr.insert_job(job);
        mgr
    }

    fn request() -> StepCreateRequest {
        StepCreateRequest {
            job_id: 1,
            user_id: 100,
            min_nodes: 2,
            num_tasks: Some(4),
            cpu_count: Some(4),
            task_dist: TaskDist::Cyclic,
            ..StepCreateRequest::default()
        }
    }

    // ── End-to-end scenarios ──────────────────────────────────────────────────

    #[test]
    fn create_debits_and_complete_restores() {
        let mut mgr = mgr();
        let mut req = request();
        req.mem_per_cpu = 1024; // 1 GB per CPU

        let step_id = mgr.step_create(req, false, 1_000).unwrap();
        let job = mgr.job(1).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        assert_eq!(step.step_node_bitmap.count(), 2, "both nodes picked");
        assert_eq!(step.step_layout.as_ref().unwrap().tasks, vec![2, 2]);
        assert_eq!(job.resources.cpus_used, vec![2, 2]);
        assert_eq!(
            job.resources.memory_used.as_ref().unwrap(),
            &vec![2048, 2048]
        );

        mgr.job_step_complete(1, step_id, 100, false, 0).unwrap();
        let job = mgr.job(1).unwrap();
        assert_eq!(job.resources.cpus_used, vec![0, 0]);
        assert_eq!(job.resources.memory_used.as_ref().unwrap(), &vec![0, 0]);
        assert_eq!(job.resources.core_bitmap_used.as_ref().unwrap().count(), 0);
        assert!(job.steps.is_empty());
    }

    #[test]
    fn exclusive_steps_contend_for_cpus() {
        let mut mgr = mgr();
        let mut req = request();
        req.exclusive = true;
        req.num_tasks = Some(8);
        req.cpu_count = Some(8);

        let s1 = mgr.step_create(req.clone(), false, 1_000).unwrap();
        assert_eq!(mgr.job(1).unwrap().resources.cpus_used, vec![4, 4]);

        // identical second step: every CPU is debited, retry may help
        let err = mgr.step_create(req, false, 1_001).unwrap_err();
        assert_eq!(err, StepError::NodesBusy);
        assert!(err.is_retryable());

        // S1 unaffected by the failed admission
        let job = mgr.job(1).unwrap();
        assert_eq!(job.steps.len(), 1);
        assert_eq!(job.steps[0].step_id, s1);
        assert_eq!(job.resources.cpus_used, vec![4, 4]);
    }

    #[test]
    fn overcommit_records_tasks_without_cpu_debit() {
        let mut mgr = mgr();
        let mut req = request();
        req.overcommit = true;
        req.num_tasks = Some(16);
        req.cpu_count = Some(8);

        let step_id = mgr.step_create(req, false, 1_000).unwrap();
        let job = mgr.job(1).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        assert_eq!(step.step_layout.as_ref().unwrap().tasks, vec![8, 8]);
        assert_eq!(step.cpus_per_task, 0, "overcommit clears the CPU request");
        assert_eq!(job.resources.cpus_used, vec![0, 0], "cpus_used unchanged");
        assert!(step.core_bitmap_job.is_none(), "no core bitmap allocation");
        assert_eq!(job.resources.core_bitmap_used.as_ref().unwrap().count(), 0);
    }

    #[test]
    fn gres_failure_reason_depends_on_cause() {
        // num_tasks=2, cpus_per_task=3; nodes have 4 free CPUs but GRES
        // supplies fewer CPU-equivalents
        let mut req = request();
        req.num_tasks = Some(2);
        req.cpu_count = Some(6);
        req.gres = Some("gpu:1".into());

        // total capacity insufficient: permanent, blame GRES
        let mut mgr = mgr_with(Plugins {
            gres: Box::new(TightGres { total: 2, avail: 2 }),
            ..Plugins::default()
        });
        assert_eq!(
            mgr.step_create(req.clone(), false, 1_000),
            Err(StepError::InvalidGres)
        );

        // live-step debits the cause: transient
        let mut mgr = mgr_with(Plugins {
            gres: Box::new(TightGres { total: 6, avail: 2 }),
            ..Plugins::default()
        });
        assert_eq!(
            mgr.step_create(req, false, 1_000),
            Err(StepError::NodesBusy)
        );
    }

    #[test]
    fn partial_completion_aggregates_and_releases_switch_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = mgr_with(Plugins {
            switch: Box::new(RecordingSwitch {
                events: events.clone(),
                supports_part_comp: false,
            }),
            ..Plugins::default()
        });
        let mut req = request();
        req.num_tasks = Some(2);
        req.cpu_count = Some(2);
        let step_id = mgr.step_create(req, false, 1_000).unwrap();

        let mut msg = StepCompleteMsg {
            job_id: 1,
            step_id,
            range_first: 0,
            range_last: 0,
            step_rc: 0,
            jobacct: JobacctDelta::default(),
        };
        let (rem, max_rc) = mgr.step_partial_comp(&msg, 0).unwrap();
        assert_eq!((rem, max_rc), (1, 0));

        msg.range_first = 1;
        msg.range_last = 1;
        msg.step_rc = 7;
        let (rem, max_rc) = mgr.step_partial_comp(&msg, 0).unwrap();
        assert_eq!((rem, max_rc), (0, 7));

        // full fabric release fired exactly once, record still present
        let fired: Vec<String> = events.lock().unwrap().clone();
        assert_eq!(fired, vec![format!("complete:{}:n0,n1", step_id)]);
        assert!(mgr.find_step(1, Some(step_id)).is_some());

        // completion removes the record; repeating is already-done
        mgr.job_step_complete(1, step_id, 100, false, 0).unwrap();
        assert_eq!(mgr.job(1).unwrap().derived_ec, 7);
        assert_eq!(
            mgr.job_step_complete(1, step_id, 100, false, 0),
            Err(StepError::AlreadyDone)
        );
        // no second fabric release
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn partial_completion_rejects_bad_ranges() {
        let mut mgr = mgr();
        let step_id = mgr.step_create(request(), false, 1_000).unwrap();

        let msg = StepCompleteMsg {
            job_id: 1,
            step_id,
            range_first: 1,
            range_last: 0,
            step_rc: 0,
            jobacct: JobacctDelta::default(),
        };
        assert!(matches!(
            mgr.step_partial_comp(&msg, 0),
            Err(StepError::InvalidNodeRange { .. })
        ));

        let msg = StepCompleteMsg {
            range_first: 0,
            range_last: 2, // step has 2 nodes, valid indexes are 0..=1
            ..msg
        };
        assert!(matches!(
            mgr.step_partial_comp(&msg, 0),
            Err(StepError::InvalidNodeRange { .. })
        ));
    }

    #[test]
    fn time_limit_sweep_queues_kill_and_keeps_record() {
        let msgs = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = mgr_with(Plugins {
            agent: Box::new(RecordingAgent { msgs: msgs.clone() }),
            ..Plugins::default()
        });
        let mut req = request();
        req.time_limit = Some(1);
        let step_id = mgr.step_create(req, false, 1_000).unwrap();

        mgr.check_step_time_limits(1_030); // 30 s: not yet
        assert!(msgs.lock().unwrap().is_empty());

        mgr.check_step_time_limits(1_061); // 61 s ≥ 1 min
        let queued = msgs.lock().unwrap().clone();
        assert_eq!(
            queued,
            vec![AgentMessage::KillTimeLimit {
                job_id: 1,
                step_id,
                nodes: vec!["n0".into(), "n1".into()],
            }]
        );
        // record stays until completion is reported
        assert!(mgr.find_step(1, Some(step_id)).is_some());
    }

    #[test]
    fn batch_step_has_no_layout_and_survives_completion_report() {
        let mut mgr = mgr();
        let mut req = request();
        req.min_nodes = 1;
        req.num_tasks = Some(1);
        req.cpu_count = None;
        let step_id = mgr.step_create(req, true, 1_000).unwrap();

        let job = mgr.job(1).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        assert!(step.batch_step);
        assert!(step.step_layout.is_none());
        assert!(step.switch_job.is_none());
        assert_eq!(job.resources.cpus_used, vec![0, 0]);

        let msg = StepCompleteMsg {
            job_id: 1,
            step_id,
            range_first: 0,
            range_last: 0,
            step_rc: 5,
            jobacct: JobacctDelta::default(),
        };
        let (rem, max_rc) = mgr.step_partial_comp(&msg, 0).unwrap();
        assert_eq!((rem, max_rc), (0, 5));
        // duplicate-removal guard: record not removed here
        assert!(mgr.find_step(1, Some(step_id)).is_some());
        assert_eq!(
            mgr.find_step(1, Some(step_id)).unwrap().exit_code,
            Some(5)
        );
    }

    // ── Boundaries ────────────────────────────────────────────────────────────

    #[test]
    fn step_id_exhaustion_refuses_creation() {
        let mut mgr = mgr();
        mgr.job_mut(1).unwrap().next_step_id = MAX_STEP_ID;
        assert_eq!(
            mgr.step_create(request(), false, 1_000),
            Err(StepError::TooManySteps)
        );
    }

    #[test]
    fn step_ids_strictly_increase() {
        let mut mgr = mgr();
        let mut req = request();
        req.num_tasks = Some(1);
        req.cpu_count = None;
        req.min_nodes = 1;
        let a = mgr.step_create(req.clone(), false, 1_000).unwrap();
        let b = mgr.step_create(req.clone(), false, 1_001).unwrap();
        let c = mgr.step_create(req, false, 1_002).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn task_count_above_cap_is_rejected() {
        let mut mgr = mgr();
        let mut req = request();
        req.overcommit = true; // skip the CPU availability check
        req.num_tasks = Some(2 * 128 + 1);
        assert_eq!(
            mgr.step_create(req, false, 1_000),
            Err(StepError::BadTaskCount)
        );
    }

    #[test]
    fn create_gates_on_job_state_and_owner() {
        let mut mgr = mgr();
        mgr.job_mut(1).unwrap().state = JobState::Suspended;
        assert_eq!(
            mgr.step_create(request(), false, 1_000),
            Err(StepError::Disabled)
        );

        mgr.job_mut(1).unwrap().state = JobState::Pending;
        assert_eq!(
            mgr.step_create(request(), false, 1_000),
            Err(StepError::DuplicateJobId)
        );

        mgr.job_mut(1).unwrap().state = JobState::Running;
        let mut req = request();
        req.user_id = 101;
        assert_eq!(
            mgr.step_create(req, false, 1_000),
            Err(StepError::AccessDenied)
        );

        mgr.job_mut(1).unwrap().state = JobState::Finished;
        assert_eq!(
            mgr.step_create(request(), false, 1_000),
            Err(StepError::AlreadyDone)
        );
    }

    #[test]
    fn oversize_strings_are_rejected() {
        let mut mgr = mgr();
        let mut req = request();
        req.name = Some("x".repeat(1025));
        assert!(matches!(
            mgr.step_create(req, false, 1_000),
            Err(StepError::PathnameTooLong { field: "name", .. })
        ));
    }

    #[test]
    fn arbitrary_dist_respects_switch_policy() {
        let mut mgr = mgr();
        mgr.config.arbitrary_dist = ArbitraryDistPolicy::Unsupported;
        let mut req = request();
        req.task_dist = TaskDist::Arbitrary;
        req.node_list = Some("n0,n1,n0,n1".into());
        assert_eq!(
            mgr.step_create(req, false, 1_000),
            Err(StepError::TaskdistArbitraryUnsupported)
        );
    }

    #[test]
    fn arbitrary_dist_honours_node_list_verbatim() {
        let mut mgr = mgr();
        let mut req = request();
        req.task_dist = TaskDist::Arbitrary;
        req.node_list = Some("n1,n0,n1".into());
        req.num_tasks = Some(3);
        req.cpu_count = None;
        req.min_nodes = 2;
        let step_id = mgr.step_create(req, false, 1_000).unwrap();
        let step = mgr.find_step(1, Some(step_id)).unwrap();
        let layout = step.step_layout.as_ref().unwrap();
        assert_eq!(layout.node_list, "n1,n0,n1");
        assert_eq!(layout.tasks, vec![1, 2]); // step-local order n0, n1
    }

    #[test]
    fn plane_without_plane_size_is_bad_distribution() {
        let mut mgr = mgr();
        let mut req = request();
        req.task_dist = TaskDist::Plane;
        req.plane_size = 0;
        assert_eq!(
            mgr.step_create(req, false, 1_000),
            Err(StepError::BadDistribution)
        );
    }

    #[test]
    fn auto_resv_port_count_is_max_tasks_plus_one() {
        let mut mgr = mgr();
        let mut req = request();
        req.resv_port_cnt = Some(0);
        let step_id = mgr.step_create(req, false, 1_000).unwrap();
        let step = mgr.find_step(1, Some(step_id)).unwrap();
        assert_eq!(step.resv_port_cnt, Some(3)); // max(tasks)=2, +1
    }

    // ── Signals ───────────────────────────────────────────────────────────────

    #[test]
    fn sigkill_records_requester_and_notifies_launcher() {
        let msgs = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = mgr_with(Plugins {
            agent: Box::new(RecordingAgent { msgs: msgs.clone() }),
            ..Plugins::default()
        });
        let step_id = mgr.step_create(request(), false, 1_000).unwrap();

        mgr.job_step_signal(1, step_id, SIGKILL, 100).unwrap();
        assert_eq!(
            mgr.find_step(1, Some(step_id)).unwrap().requid,
            Some(100)
        );
        let queued = msgs.lock().unwrap().clone();
        assert_eq!(queued.len(), 2);
        assert!(matches!(
            queued[0],
            AgentMessage::LauncherStepComplete { step_id: s, .. } if s == step_id
        ));
        assert!(matches!(
            &queued[1],
            AgentMessage::SignalTasks { signal: SIGKILL, nodes, .. } if nodes.len() == 2
        ));
    }

    #[test]
    fn signal_requires_running_job_and_owner() {
        let mut mgr = mgr();
        let step_id = mgr.step_create(request(), false, 1_000).unwrap();

        assert_eq!(
            mgr.job_step_signal(1, step_id, 2, 999),
            Err(StepError::UserIdMissing)
        );
        mgr.job_mut(1).unwrap().state = JobState::Suspended;
        assert_eq!(
            mgr.job_step_signal(1, step_id, 2, 100),
            Err(StepError::TransitionStateNoUpdate)
        );
        mgr.job_mut(1).unwrap().state = JobState::Finished;
        assert_eq!(
            mgr.job_step_signal(1, step_id, 2, 100),
            Err(StepError::AlreadyDone)
        );
    }

    #[test]
    fn per_node_signal_addresses_one_node() {
        let msgs = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = mgr_with(Plugins {
            agent: Box::new(RecordingAgent { msgs: msgs.clone() }),
            ..Plugins::default()
        });
        let step_id = mgr.step_create(request(), false, 1_000).unwrap();

        mgr.signal_step_on_node(1, step_id, "n1", 10).unwrap();
        let queued = msgs.lock().unwrap().clone();
        assert_eq!(
            queued,
            vec![AgentMessage::SignalTasks {
                job_id: 1,
                step_id,
                signal: 10,
                nodes: vec!["n1".into()],
            }]
        );
    }

    #[test]
    fn kill_step_on_node_skips_no_kill_steps() {
        let msgs = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = mgr_with(Plugins {
            agent: Box::new(RecordingAgent { msgs: msgs.clone() }),
            ..Plugins::default()
        });
        let keep = {
            let mut req = request();
            req.no_kill = true;
            mgr.step_create(req, false, 1_000).unwrap()
        };
        let kill = mgr.step_create(request(), false, 1_001).unwrap();

        assert_eq!(mgr.kill_step_on_node(1, "n0"), 1);
        let queued = msgs.lock().unwrap().clone();
        assert!(queued.iter().any(|m| matches!(
            m,
            AgentMessage::TerminateTasks { step_id, .. } if *step_id == kill
        )));
        assert!(!queued.iter().any(|m| matches!(
            m,
            AgentMessage::TerminateTasks { step_id, .. } if *step_id == keep
        )));
    }

    // ── Suspend / resume ──────────────────────────────────────────────────────

    #[test]
    fn suspend_resume_bookkeeping() {
        let mut mgr = mgr();
        let step_id = mgr.step_create(request(), false, 100).unwrap();

        // suspend at t=200 (job.suspend_time not yet recorded)
        mgr.suspend_job_steps(1, 200);
        mgr.job_mut(1).unwrap().suspend_time = 200;
        mgr.job_mut(1).unwrap().state = JobState::Suspended;
        let step = mgr.find_step(1, Some(step_id)).unwrap();
        assert_eq!(step.pre_sus_time, 100); // ran 100..200

        // resume at t=260: 60 s suspended
        mgr.resume_job_steps(1, 260);
        mgr.job_mut(1).unwrap().state = JobState::Running;
        let step = mgr.find_step(1, Some(step_id)).unwrap();
        assert_eq!(step.tot_sus_time, 60);
    }

    // ── Updates / listing ─────────────────────────────────────────────────────

    #[test]
    fn update_step_checks_authorization() {
        let mut mgr = mgr();
        let step_id = mgr.step_create(request(), false, 1_000).unwrap();

        let stranger = Viewer {
            uid: 999,
            ..Viewer::default()
        };
        assert_eq!(
            mgr.update_step(1, Some(step_id), Some(5), &stranger),
            Err(StepError::UserIdMissing)
        );

        let operator = Viewer {
            uid: 999,
            operator: true,
            ..Viewer::default()
        };
        mgr.update_step(1, Some(step_id), Some(5), &operator).unwrap();
        assert_eq!(
            mgr.find_step(1, Some(step_id)).unwrap().time_limit,
            Some(5)
        );

        // None step id updates every step
        let owner = Viewer {
            uid: 100,
            ..Viewer::default()
        };
        mgr.update_step(1, None, None, &owner).unwrap();
        assert_eq!(mgr.find_step(1, Some(step_id)).unwrap().time_limit, None);

        assert_eq!(
            mgr.update_step(1, Some(404), Some(5), &owner),
            Err(StepError::InvalidStepId)
        );
    }

    #[test]
    fn step_listing_applies_privacy_rule() {
        let mut mgr = mgr();
        mgr.config.private_jobs = true;
        let step_id = mgr.step_create(request(), false, 1_000).unwrap();

        let owner = Viewer {
            uid: 100,
            ..Viewer::default()
        };
        let filter = StepInfoFilter {
            job_id: Some(1),
            ..StepInfoFilter::default()
        };
        let infos = mgr.step_info(&filter, &owner, 2_000).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].step_id, step_id);
        assert_eq!(infos[0].node_list, "n0,n1");
        assert_eq!(infos[0].run_time, 1_000);

        let stranger = Viewer {
            uid: 999,
            ..Viewer::default()
        };
        assert!(matches!(
            mgr.step_info(&filter, &stranger, 2_000),
            Err(StepError::InvalidJobId)
        ));

        // account coordinators see through the privacy gate
        mgr.job_mut(1).unwrap().account = "physics".into();
        let coord = Viewer {
            uid: 999,
            coord_accounts: vec!["physics".into()],
            ..Viewer::default()
        };
        assert_eq!(mgr.step_info(&filter, &coord, 2_000).unwrap().len(), 1);
    }

    #[test]
    fn hidden_partition_needs_show_all() {
        let mut mgr = mgr();
        mgr.step_create(request(), false, 1_000).unwrap();
        mgr.job_mut(1).unwrap().partition_hidden = true;

        let viewer = Viewer {
            uid: 100,
            ..Viewer::default()
        };
        let hidden = mgr.step_info(&StepInfoFilter::default(), &viewer, 2_000);
        assert!(hidden.is_err());

        let all = StepInfoFilter {
            show_all: true,
            ..StepInfoFilter::default()
        };
        assert_eq!(mgr.step_info(&all, &viewer, 2_000).unwrap().len(), 1);
    }

    // ── Shutdown path ─────────────────────────────────────────────────────────

    #[test]
    fn delete_step_records_honours_switch_filter() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = mgr_with(Plugins {
            switch: Box::new(RecordingSwitch {
                events: events.clone(),
                supports_part_comp: false,
            }),
            ..Plugins::default()
        });
        let regular = mgr.step_create(request(), false, 1_000).unwrap();
        let batch = {
            let mut req = request();
            req.min_nodes = 1;
            req.num_tasks = Some(1);
            req.cpu_count = None;
            mgr.step_create(req, true, 1_001).unwrap()
        };

        // keep steps that still hold fabric state
        mgr.delete_step_records(1, DeleteFilter::WithoutSwitch);
        let job = mgr.job(1).unwrap();
        assert_eq!(job.steps.len(), 1);
        assert_eq!(job.steps[0].step_id, regular);
        assert_ne!(regular, batch);

        mgr.delete_step_records(1, DeleteFilter::All);
        assert!(mgr.job(1).unwrap().steps.is_empty());
        assert_eq!(events.lock().unwrap().len(), 1, "fabric released once");
    }

    // ── Snapshot wrappers ─────────────────────────────────────────────────────

    #[test]
    fn snapshot_round_trip_through_manager() {
        let mut mgr = mgr();
        let step_id = mgr.step_create(request(), false, 1_000).unwrap();
        let dump = mgr.dump_job_steps(1).unwrap();

        mgr.job_mut(1).unwrap().steps.clear();
        mgr.job_mut(1).unwrap().next_step_id = 0;
        let n = mgr.load_job_steps(1, &dump).unwrap();
        assert_eq!(n, 1);
        let job = mgr.job(1).unwrap();
        assert_eq!(job.next_step_id, step_id + 1);
        let step = job.find_step(Some(step_id)).unwrap();
        assert_eq!(step.step_layout.as_ref().unwrap().tasks, vec![2, 2]);
    }
}
