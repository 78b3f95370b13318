/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Resource accounting: debit a job's allocation when a step is placed and
//! credit it back on release.
//!
//! Credits clamp at zero and log an underflow instead of wrapping — that
//! records a bug somewhere upstream while keeping the per-node counters
//! inside their invariants.  `--overcommit` steps can push `cpus_used`
//! above `cpus`; that is recorded truthfully.

use tracing::{debug, error, info};

use crate::bitmap::Bitmap;
use crate::job::{JobRecord, JobResources};
use crate::plugins::GresPlugin;
use crate::step::StepRecord;

/// Debit CPUs, memory, GRES, and cores for a freshly placed step.
///
/// Batch steps have no layout and debit nothing.  `last_core_inx` is the
/// manager's rotating oversubscription bias.
pub(crate) fn step_alloc_lps(
    job: &mut JobRecord,
    step: &mut StepRecord,
    mem_reserved: bool,
    gres: &dyn GresPlugin,
    last_core_inx: &mut u32,
) {
    let Some(layout) = &step.step_layout else {
        return; // batch step
    };
    let tasks = layout.tasks.clone();
    let node_cnt = layout.node_cnt as usize;
    let resrcs = &mut job.resources;

    let mut pick_cores = true;
    if resrcs.core_bitmap.is_none() || resrcs.core_bitmap_used.is_none() {
        // platform without core-level accounting
        pick_cores = false;
    } else if step.core_bitmap_job.is_some() {
        // live-system reconfiguration, cores already recorded
        pick_cores = false;
    } else if !step.exclusive || step.cpu_count == resrcs.total_cpus() {
        // step uses all of the job's cores; recorded implicitly
        pick_cores = false;
    }

    if step.mem_per_cpu > 0 && mem_reserved && !resrcs.has_memory() {
        error!(
            job_id = job.job_id,
            "lack memory allocation details to enforce memory limits"
        );
        step.mem_per_cpu = 0;
    }

    let mut step_node_inx = 0usize;
    for (job_node_inx, i) in resrcs.node_bitmap.clone().iter_set().enumerate() {
        if !step.step_node_bitmap.test(i) {
            continue;
        }
        // --overcommit can push cpus_used above cpus
        let cpus_alloc = tasks[step_node_inx] * step.cpus_per_task;
        resrcs.cpus_used[job_node_inx] += cpus_alloc;
        if let Some(handle) = &step.gres_handle {
            gres.step_alloc(handle, job_node_inx, cpus_alloc, step.step_id);
        }
        if step.mem_per_cpu > 0 && mem_reserved {
            if let Some(used) = resrcs.memory_used.as_mut() {
                used[job_node_inx] += step.mem_per_cpu * cpus_alloc as u64;
            }
        }
        if pick_cores {
            pick_step_cores(step, resrcs, job_node_inx, tasks[step_node_inx], last_core_inx);
        }
        debug!(
            job_id = job.job_id,
            step_id = step.step_id,
            node_inx = job_node_inx,
            cpus_used = resrcs.cpus_used[job_node_inx],
            cpus = resrcs.cpus[job_node_inx],
            "step alloc of procs"
        );
        step_node_inx += 1;
        if step_node_inx == node_cnt {
            break;
        }
    }
    gres.step_state_log(step.gres_handle.as_ref(), job.job_id, step.step_id);
}

/// Credit back everything [`step_alloc_lps`] debited.  Idempotent from the
/// caller's view: the step's core bitmap is taken on release, and CPU and
/// memory credits clamp at zero.
pub(crate) fn step_dealloc_lps(job: &mut JobRecord, step: &mut StepRecord, mem_reserved: bool) {
    let Some(layout) = &step.step_layout else {
        return; // batch step
    };
    let tasks = layout.tasks.clone();
    let node_cnt = layout.node_cnt as usize;
    let resrcs = &mut job.resources;

    if step.mem_per_cpu > 0 && mem_reserved && !resrcs.has_memory() {
        error!(
            job_id = job.job_id,
            "lack memory allocation details to enforce memory limits"
        );
        step.mem_per_cpu = 0;
    }

    let mut step_node_inx = 0usize;
    for (job_node_inx, i) in resrcs.node_bitmap.clone().iter_set().enumerate() {
        if !step.step_node_bitmap.test(i) {
            continue;
        }
        let cpus_alloc = tasks[step_node_inx] * step.cpus_per_task;
        if resrcs.cpus_used[job_node_inx] >= cpus_alloc {
            resrcs.cpus_used[job_node_inx] -= cpus_alloc;
        } else {
            error!(
                job_id = job.job_id,
                step_id = step.step_id,
                node_inx = job_node_inx,
                "cpu underflow on step deallocation"
            );
            resrcs.cpus_used[job_node_inx] = 0;
        }
        if step.mem_per_cpu > 0 && mem_reserved {
            if let Some(used) = resrcs.memory_used.as_mut() {
                let mem_use = step.mem_per_cpu * cpus_alloc as u64;
                if used[job_node_inx] >= mem_use {
                    used[job_node_inx] -= mem_use;
                } else {
                    error!(
                        job_id = job.job_id,
                        step_id = step.step_id,
                        node_inx = job_node_inx,
                        "memory underflow on step deallocation"
                    );
                    used[job_node_inx] = 0;
                }
            }
        }
        debug!(
            job_id = job.job_id,
            step_id = step.step_id,
            node_inx = job_node_inx,
            cpus_used = resrcs.cpus_used[job_node_inx],
            cpus = resrcs.cpus[job_node_inx],
            "step dealloc of procs"
        );
        step_node_inx += 1;
        if step_node_inx == node_cnt {
            break;
        }
    }

    // mark the job's cores as no longer in use; the step bitmap lives in
    // the job-global core space, so a single and-not releases them
    if let Some(step_cores) = step.core_bitmap_job.take() {
        if let Some(used) = resrcs.core_bitmap_used.as_mut() {
            used.and_not(&step_cores);
        }
    }
}

/// Select cores for `task_cnt` tasks on one node of the step.
///
/// First pass walks core-major / socket-minor so the step spreads across
/// sockets before doubling up on one.  If the step demands more cores than
/// remain free, a second pass oversubscribes starting from the rotating
/// `last_core_inx` so the extra load does not always land on core zero.
pub(crate) fn pick_step_cores(
    step: &mut StepRecord,
    resrcs: &mut JobResources,
    job_node_inx: usize,
    task_cnt: u32,
    last_core_inx: &mut u32,
) {
    let (sockets, cores) = resrcs.node_topology(job_node_inx);
    if cores == 0 || sockets == 0 {
        return;
    }
    let base = resrcs.core_offset(job_node_inx, 0, 0);
    let cores_usize = cores as usize;

    let JobResources {
        core_bitmap,
        core_bitmap_used,
        ..
    } = resrcs;
    let (Some(core_bm), Some(used_bm)) = (core_bitmap.as_ref(), core_bitmap_used.as_mut()) else {
        return;
    };
    let step_bm = step
        .core_bitmap_job
        .get_or_insert_with(|| Bitmap::new(core_bm.size()));

    let use_all_cores = task_cnt == sockets as u32 * cores as u32;
    let mut cpu_cnt = task_cnt;
    if step.cpus_per_task > 0 {
        cpu_cnt *= step.cpus_per_task;
    }
    if cpu_cnt == 0 {
        return;
    }
    let offset = |sock: u16, core: u16| base + sock as usize * cores_usize + core as usize;

    // select idle cores first
    for core_inx in 0..cores {
        for sock_inx in 0..sockets {
            let bit = offset(sock_inx, core_inx);
            if !core_bm.test(bit) {
                continue;
            }
            if !use_all_cores && used_bm.test(bit) {
                continue;
            }
            used_bm.set(bit);
            step_bm.set(bit);
            cpu_cnt -= 1;
            if cpu_cnt == 0 {
                return;
            }
        }
    }
    if use_all_cores {
        return;
    }

    // Over-subscribe one or more cores, starting away from core zero.
    info!(
        step_id = step.step_id,
        "job step needs to over-subscribe cores"
    );
    *last_core_inx = (*last_core_inx + 1) % cores as u32;
    for i in 0..cores as u32 {
        let core_inx = ((*last_core_inx + i) % cores as u32) as u16;
        for sock_inx in 0..sockets {
            let bit = offset(sock_inx, core_inx);
            if !core_bm.test(bit) {
                continue;
            }
            if step_bm.test(bit) {
                continue; // already taken by this step
            }
            step_bm.set(bit);
            cpu_cnt -= 1;
            if cpu_cnt == 0 {
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
