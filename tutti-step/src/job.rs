/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Job-side data model and the per-job step registry.
//!
//! The job record is produced by the parent job scheduler and is
//! read-mostly here; the step manager owns only the debit fields of
//! [`JobResources`] (`cpus_used`, `memory_used`, `core_bitmap_used`), the
//! step registry, and the bookkeeping timestamps.
//!
//! # Ownership model
//! The job owns its steps (`steps: Vec<StepRecord>`, insertion-ordered).
//! A step never holds a reference back to its job; the manager passes both
//! down call chains, so there is no cyclic ownership to break.

use tracing::info;

use crate::bitmap::Bitmap;
use crate::step::StepRecord;

// ── Job state ─────────────────────────────────────────────────────────────────

/// Lifecycle state of the parent job.  Only `Running` admits new steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Finished,
}

// ── Job resources ─────────────────────────────────────────────────────────────

/// The job's fixed allocation plus the per-node debit state the step
/// manager maintains against it.
///
/// Per-node arrays are indexed by *job-local* node index (position of the
/// node within `node_bitmap`, bit-index ascending, 0..nhosts).  The core
/// bitmaps are indexed over the *job-global* core space: node 0's cores
/// first (socket-major), then node 1's, and so on.
#[derive(Debug, Clone)]
pub struct JobResources {
    /// Nodes of this allocation, cluster-indexed.
    pub node_bitmap: Bitmap,
    /// CPUs allocated per node.
    pub cpus: Vec<u32>,
    /// CPUs debited per node by live steps.  `--overcommit` steps may push
    /// this above `cpus`; that is recorded truthfully.
    pub cpus_used: Vec<u32>,
    /// Memory (MB) allocated per node; absent when the cluster does not
    /// track memory.
    pub memory_allocated: Option<Vec<u64>>,
    /// Memory (MB) debited per node by live steps.
    pub memory_used: Option<Vec<u64>>,
    /// Sockets per node.
    pub sockets_per_node: Vec<u16>,
    /// Cores per socket, per node.
    pub cores_per_socket: Vec<u16>,
    /// Cores allocated to the job; absent on platforms without core-level
    /// accounting (the core picker is skipped entirely there).
    pub core_bitmap: Option<Bitmap>,
    /// Cores debited by live exclusive steps.
    pub core_bitmap_used: Option<Bitmap>,
    /// Run-length encoding of `cpus`: distinct per-node CPU counts.
    pub cpu_array_value: Vec<u32>,
    /// Repetition count for each entry of `cpu_array_value`.
    pub cpu_array_reps: Vec<u32>,
}

impl JobResources {
    /// Build a resource record for `node_bitmap` with per-node `cpus`,
    /// optional per-node memory, and a uniform sockets × cores topology.
    pub fn new(
        node_bitmap: Bitmap,
        cpus: Vec<u32>,
        memory_allocated: Option<Vec<u64>>,
        sockets_per_node: u16,
        cores_per_socket: u16,
    ) -> Self {
        let nhosts = node_bitmap.count();
        assert_eq!(cpus.len(), nhosts, "cpus array must cover every job node");
        if let Some(mem) = &memory_allocated {
            assert_eq!(mem.len(), nhosts, "memory array must cover every job node");
        }

        let (cpu_array_value, cpu_array_reps) = rle(&cpus);
        let total_cores = nhosts * sockets_per_node as usize * cores_per_socket as usize;
        let core_bitmap = (total_cores > 0).then(|| Bitmap::filled(total_cores));
        let core_bitmap_used = (total_cores > 0).then(|| Bitmap::new(total_cores));
        let memory_used = memory_allocated.as_ref().map(|m| vec![0; m.len()]);

        Self {
            node_bitmap,
            cpus_used: vec![0; nhosts],
            cpus,
            memory_allocated,
            memory_used,
            sockets_per_node: vec![sockets_per_node; nhosts],
            cores_per_socket: vec![cores_per_socket; nhosts],
            core_bitmap,
            core_bitmap_used,
            cpu_array_value,
            cpu_array_reps,
        }
    }

    pub fn nhosts(&self) -> usize {
        self.cpus.len()
    }

    /// Total CPUs across the allocation.
    pub fn total_cpus(&self) -> u32 {
        self.cpus.iter().sum()
    }

    /// Job-local index of the cluster node `cluster_inx`, or `None` if the
    /// node is not part of this allocation.
    pub fn node_inx(&self, cluster_inx: usize) -> Option<usize> {
        self.node_bitmap.position_of(cluster_inx)
    }

    /// Sockets and cores-per-socket of job node `job_node_inx`.
    pub fn node_topology(&self, job_node_inx: usize) -> (u16, u16) {
        (
            self.sockets_per_node[job_node_inx],
            self.cores_per_socket[job_node_inx],
        )
    }

    /// Offset of `(job_node_inx, sock_inx, core_inx)` in the job-global
    /// core space.
    pub fn core_offset(&self, job_node_inx: usize, sock_inx: u16, core_inx: u16) -> usize {
        let mut base = 0usize;
        for node in 0..job_node_inx {
            base += self.sockets_per_node[node] as usize * self.cores_per_socket[node] as usize;
        }
        base
            + sock_inx as usize * self.cores_per_socket[job_node_inx] as usize
            + core_inx as usize
    }

    /// True when every node of the allocation carries the same CPU count.
    pub fn homogeneous(&self) -> bool {
        self.cpu_array_value.len() == 1
    }

    /// True when memory is tracked for this allocation.
    pub fn has_memory(&self) -> bool {
        self.memory_allocated.is_some() && self.memory_used.is_some()
    }
}

fn rle(values: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let mut vals = Vec::new();
    let mut reps: Vec<u32> = Vec::new();
    for &v in values {
        match vals.last() {
            Some(&last) if last == v => *reps.last_mut().unwrap() += 1,
            _ => {
                vals.push(v);
                reps.push(1);
            }
        }
    }
    (vals, reps)
}

// ── Job record ────────────────────────────────────────────────────────────────

/// A parent resource allocation with fixed nodes, CPUs, memory, cores, and
/// GRES, plus its ordered step registry.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: u32,
    pub user_id: u32,
    pub name: String,
    pub network: Option<String>,
    pub partition: String,
    pub partition_hidden: bool,
    pub account: String,
    /// Front-end systems funnel per-node traffic through this host.
    pub batch_host: Option<String>,
    /// Job was submitted as a batch script.
    pub batch_flag: bool,
    pub state: JobState,
    /// Set until the allocation's nodes have all booted; cleared by the
    /// first successful step placement.
    pub configuring: bool,
    pub prolog_running: bool,
    /// Nodes of the allocation, cluster-indexed (mirrors
    /// `resources.node_bitmap`).
    pub node_bitmap: Bitmap,
    pub resources: JobResources,
    /// Job-level GRES pool description; interpreted only by the GRES
    /// plugin.
    pub gres: Option<String>,
    /// Minutes; `None` = no limit.
    pub time_limit: Option<u32>,
    pub start_time: u64,
    pub end_time: u64,
    /// Last suspend timestamp; 0 = never suspended.
    pub suspend_time: u64,
    /// Batch-script checkpoint interval, minutes; 0 = disabled.
    pub ckpt_interval: u16,
    pub ckpt_time: u64,
    pub ckpt_dir: Option<String>,
    /// Highest exit code seen across the job's completed steps.
    pub derived_ec: u32,
    /// Monotonic step id counter; ids ≥ [`MAX_STEP_ID`] are refused.
    ///
    /// [`MAX_STEP_ID`]: crate::MAX_STEP_ID
    pub next_step_id: u32,
    /// Insertion-ordered step registry.
    pub steps: Vec<StepRecord>,
}

impl JobRecord {
    /// Minimal running job over the given allocation; callers adjust the
    /// public fields for anything else.
    pub fn new(job_id: u32, user_id: u32, resources: JobResources) -> Self {
        Self {
            job_id,
            user_id,
            name: String::new(),
            network: None,
            partition: String::from("batch"),
            partition_hidden: false,
            account: String::new(),
            batch_host: None,
            batch_flag: false,
            state: JobState::Running,
            configuring: false,
            prolog_running: false,
            node_bitmap: resources.node_bitmap.clone(),
            resources,
            gres: None,
            time_limit: None,
            start_time: 0,
            end_time: u64::MAX,
            suspend_time: 0,
            ckpt_interval: 0,
            ckpt_time: 0,
            ckpt_dir: None,
            derived_ec: 0,
            next_step_id: 0,
            steps: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_suspended(&self) -> bool {
        self.state == JobState::Suspended
    }

    pub fn is_finished(&self) -> bool {
        self.state == JobState::Finished
    }

    // ── Step registry (ordered collection) ────────────────────────────────────

    /// Find a step by id; `None` matches the first step, mirroring the
    /// "first/any" sentinel of the lookup RPC.
    pub fn find_step(&self, step_id: Option<u32>) -> Option<&StepRecord> {
        match step_id {
            Some(id) => self.steps.iter().find(|s| s.step_id == id),
            None => self.steps.first(),
        }
    }

    pub fn find_step_mut(&mut self, step_id: Option<u32>) -> Option<&mut StepRecord> {
        match step_id {
            Some(id) => self.steps.iter_mut().find(|s| s.step_id == id),
            None => self.steps.first_mut(),
        }
    }

    /// Remove a step from the registry, preserving the order of the rest.
    pub fn remove_step(&mut self, step_id: u32) -> Option<StepRecord> {
        let pos = self.steps.iter().position(|s| s.step_id == step_id)?;
        let step = self.steps.remove(pos);
        info!(
            job_id = self.job_id,
            step_id = step_id,
            "step removed from registry"
        );
        Some(step)
    }

    /// Union of every live step's node bitmap (cluster-indexed).
    pub fn steps_node_union(&self) -> Bitmap {
        let mut union = Bitmap::new(self.node_bitmap.size());
        for step in &self.steps {
            union.or(&step.step_node_bitmap);
        }
        union
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepRecord;

    fn two_node_resources() -> JobResources {
        let mut bm = Bitmap::new(4);
        bm.set(1);
        bm.set(3);
        JobResources::new(bm, vec![4, 8], Some(vec![8192, 8192]), 2, 2)
    }

    #[test]
    fn node_inx_maps_cluster_to_job_space() {
        let res = two_node_resources();
        assert_eq!(res.node_inx(1), Some(0));
        assert_eq!(res.node_inx(3), Some(1));
        assert_eq!(res.node_inx(0), None);
    }

    #[test]
    fn core_offsets_are_socket_major_per_node() {
        let res = two_node_resources();
        // node 0: offsets 0..4 (2 sockets × 2 cores), node 1: offsets 4..8
        assert_eq!(res.core_offset(0, 0, 0), 0);
        assert_eq!(res.core_offset(0, 1, 0), 2);
        assert_eq!(res.core_offset(0, 1, 1), 3);
        assert_eq!(res.core_offset(1, 0, 0), 4);
    }

    #[test]
    fn cpu_array_is_run_length_encoded() {
        let res = two_node_resources();
        assert_eq!(res.cpu_array_value, vec![4, 8]);
        assert_eq!(res.cpu_array_reps, vec![1, 1]);
        assert!(!res.homogeneous());

        let mut bm = Bitmap::new(2);
        bm.set(0);
        bm.set(1);
        let uniform = JobResources::new(bm, vec![4, 4], None, 1, 4);
        assert_eq!(uniform.cpu_array_value, vec![4]);
        assert_eq!(uniform.cpu_array_reps, vec![2]);
        assert!(uniform.homogeneous());
    }

    #[test]
    fn registry_preserves_insertion_order() {
        let mut job = JobRecord::new(1, 100, two_node_resources());
        for id in [0, 1, 2] {
            job.steps.push(StepRecord::new(id, 0, job.node_bitmap.clone()));
        }
        let ids: Vec<u32> = job.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        job.remove_step(1);
        let ids: Vec<u32> = job.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn find_step_none_returns_first() {
        let mut job = JobRecord::new(1, 100, two_node_resources());
        job.steps.push(StepRecord::new(7, 0, job.node_bitmap.clone()));
        job.steps.push(StepRecord::new(9, 0, job.node_bitmap.clone()));
        assert_eq!(job.find_step(None).unwrap().step_id, 7);
        assert_eq!(job.find_step(Some(9)).unwrap().step_id, 9);
        assert!(job.find_step(Some(8)).is_none());
    }
}
