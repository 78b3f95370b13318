/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! State snapshot: dump a job's step registry in order and rebuild it on
//! restart.
//!
//! The document is version-tagged JSON; the byte layout is not part of the
//! crate's contract.  Bitmaps travel as range-format strings plus their
//! width, and `exit_node_bitmap` is present only when a partial completion
//! was in flight at dump time.  On load the layouts and bitmaps are
//! rebuilt in packed form and the switch plugin is told the step exists on
//! its nodes.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::bitmap::Bitmap;
use crate::cluster::NodeInventory;
use crate::job::JobRecord;
use crate::plugins::Plugins;
use crate::step::{StepLayout, StepRecord};

/// Current snapshot document version.
const SNAPSHOT_VERSION: u32 = 1;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no job {0} registered")]
    UnknownJob(u32),

    #[error("unsupported snapshot version {0}")]
    BadVersion(u32),

    #[error("snapshot names unknown node(s): {0}")]
    UnknownNodes(String),

    #[error("bad bitmap in snapshot: {0}")]
    BadBitmap(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

// ── Document layout ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct LayoutState {
    node_list: String,
    node_cnt: u32,
    tasks: Vec<u32>,
    task_cnt: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepState {
    step_id: u32,
    cyclic_alloc: bool,
    port: u16,
    ckpt_interval: u16,
    cpus_per_task: u32,
    resv_port_cnt: Option<u16>,
    no_kill: bool,
    exclusive: bool,
    cpu_count: u32,
    mem_per_cpu: u64,
    /// Present only when at least one completion report arrived.
    exit_code: Option<u32>,
    exit_node_bitmap: Option<String>,
    exit_bit_cnt: Option<u32>,
    /// 0 = no per-step core bitmap (all-cores step or no core accounting).
    core_size: u32,
    core_bitmap_job: Option<String>,
    time_limit: Option<u32>,
    start_time: u64,
    pre_sus_time: u64,
    tot_sus_time: u64,
    ckpt_time: u64,
    host: Option<String>,
    name: String,
    network: Option<String>,
    ckpt_dir: Option<String>,
    gres: Option<String>,
    batch_step: bool,
    layout: Option<LayoutState>,
    switch: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepStateDump {
    version: u32,
    job_id: u32,
    steps: Vec<StepState>,
}

// ── Dump ──────────────────────────────────────────────────────────────────────

pub(crate) fn dump_job_steps(job: &JobRecord) -> Result<String, SnapshotError> {
    let steps = job.steps.iter().map(dump_step).collect();
    let dump = StepStateDump {
        version: SNAPSHOT_VERSION,
        job_id: job.job_id,
        steps,
    };
    Ok(serde_json::to_string(&dump)?)
}

fn dump_step(step: &StepRecord) -> StepState {
    let (exit_node_bitmap, exit_bit_cnt) = match (&step.exit_code, &step.exit_node_bitmap) {
        (Some(_), Some(bm)) => (Some(bm.to_range_fmt()), Some(bm.size() as u32)),
        _ => (None, None),
    };
    let (core_size, core_bitmap_job) = match &step.core_bitmap_job {
        Some(bm) => (bm.size() as u32, Some(bm.to_range_fmt())),
        None => (0, None),
    };
    StepState {
        step_id: step.step_id,
        cyclic_alloc: step.cyclic_alloc,
        port: step.port,
        ckpt_interval: step.ckpt_interval,
        cpus_per_task: step.cpus_per_task,
        resv_port_cnt: step.resv_port_cnt,
        no_kill: step.no_kill,
        exclusive: step.exclusive,
        cpu_count: step.cpu_count,
        mem_per_cpu: step.mem_per_cpu,
        exit_code: step.exit_code,
        exit_node_bitmap,
        exit_bit_cnt,
        core_size,
        core_bitmap_job,
        time_limit: step.time_limit,
        start_time: step.start_time,
        pre_sus_time: step.pre_sus_time,
        tot_sus_time: step.tot_sus_time,
        ckpt_time: step.ckpt_time,
        host: step.host.clone(),
        name: step.name.clone(),
        network: step.network.clone(),
        ckpt_dir: step.ckpt_dir.clone(),
        gres: step.gres.clone(),
        batch_step: step.batch_step,
        layout: step.step_layout.as_ref().map(|l| LayoutState {
            node_list: l.node_list.clone(),
            node_cnt: l.node_cnt,
            tasks: l.tasks.clone(),
            task_cnt: l.task_cnt,
        }),
        switch: step.switch_job.is_some(),
    }
}

// ── Load ──────────────────────────────────────────────────────────────────────

pub(crate) fn load_job_steps(
    job: &mut JobRecord,
    data: &str,
    inventory: &NodeInventory,
    plugins: &Plugins,
) -> Result<usize, SnapshotError> {
    let dump: StepStateDump = serde_json::from_str(data)?;
    if dump.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::BadVersion(dump.version));
    }

    let mut recovered = 0usize;
    for state in dump.steps {
        let step = load_step(job, state, inventory, plugins)?;
        info!(
            job_id = job.job_id,
            step_id = step,
            "recovered job step"
        );
        recovered += 1;
    }
    Ok(recovered)
}

fn load_step(
    job: &mut JobRecord,
    state: StepState,
    inventory: &NodeInventory,
    plugins: &Plugins,
) -> Result<u32, SnapshotError> {
    // rebuild the node bitmap: from the layout for regular steps, the
    // whole allocation for a batch script
    let step_node_bitmap = match &state.layout {
        Some(layout) => inventory
            .names_to_bitmap(&layout.node_list)
            .ok_or_else(|| SnapshotError::UnknownNodes(layout.node_list.clone()))?,
        None => job.node_bitmap.clone(),
    };

    let exit_node_bitmap = match (&state.exit_node_bitmap, state.exit_bit_cnt) {
        (Some(fmt), Some(cnt)) => Some(
            Bitmap::from_range_fmt(cnt as usize, fmt).map_err(SnapshotError::BadBitmap)?,
        ),
        _ => None,
    };
    let core_bitmap_job = match (state.core_size, &state.core_bitmap_job) {
        (0, _) => None,
        (size, Some(fmt)) => Some(
            Bitmap::from_range_fmt(size as usize, fmt).map_err(SnapshotError::BadBitmap)?,
        ),
        (_, None) => None,
    };

    let step_id = state.step_id;
    if job.find_step(Some(step_id)).is_none() {
        job.steps
            .push(StepRecord::new(step_id, state.start_time, step_node_bitmap.clone()));
    }
    job.next_step_id = job.next_step_id.max(step_id + 1);

    let job_id = job.job_id;
    let step = job
        .find_step_mut(Some(step_id))
        .expect("step inserted above");
    step.step_node_bitmap = step_node_bitmap;
    step.cyclic_alloc = state.cyclic_alloc;
    step.port = state.port;
    step.ckpt_interval = state.ckpt_interval;
    step.cpus_per_task = state.cpus_per_task;
    step.resv_port_cnt = state.resv_port_cnt;
    step.no_kill = state.no_kill;
    step.exclusive = state.exclusive;
    step.cpu_count = state.cpu_count;
    step.mem_per_cpu = state.mem_per_cpu;
    step.exit_code = state.exit_code;
    step.exit_node_bitmap = exit_node_bitmap;
    step.core_bitmap_job = core_bitmap_job;
    step.time_limit = state.time_limit;
    step.start_time = state.start_time;
    step.pre_sus_time = state.pre_sus_time;
    step.tot_sus_time = state.tot_sus_time;
    step.ckpt_time = state.ckpt_time;
    step.host = state.host;
    step.name = state.name;
    step.network = state.network;
    step.ckpt_dir = state.ckpt_dir;
    step.gres = state.gres;
    step.batch_step = state.batch_step;
    step.step_layout = state.layout.map(|l| StepLayout {
        node_list: l.node_list,
        node_cnt: l.node_cnt,
        tasks: l.tasks,
        task_cnt: l.task_cnt,
    });

    if state.switch && !state.batch_step {
        let switch_job = plugins.switch.alloc_jobinfo(job_id, step_id);
        let node_list = step.step_layout.as_ref().map(|l| l.node_list.as_str());
        plugins.switch.job_step_allocated(&switch_job, node_list);
        step.switch_job = Some(switch_job);
    }
    step.check_job = Some(plugins.checkpoint.alloc_jobinfo(job_id, step_id));

    Ok(step_id)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
