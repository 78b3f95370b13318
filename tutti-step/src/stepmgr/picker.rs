/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Node picker: select a node subset satisfying a step request.
//!
//! The picker satisfies the super-set of the request's constraints (CPU
//! count, memory, GRES, named nodes, relative offset, exclusivity) against
//! the job's current debit state.  Bitmap iteration is bit-index ascending
//! throughout, so the choice is deterministic and reproducible independent
//! of request order.
//!
//! Failure classification is load-bearing (§ upstream retry logic):
//! *nodes-busy* is transient, *config-unavailable* is permanent,
//! *node-not-avail* means a job node is down.  When memory or GRES
//! clamping is what made the request impossible, the tightest clamp's
//! reason (*invalid-task-memory* / *invalid-gres*) is returned instead of
//! the generic permanent error.

use tracing::{debug, error, info};

use crate::bitmap::Bitmap;
use crate::cluster::NodeInventory;
use crate::config::{ArbitraryDistPolicy, StepmgrConfig};
use crate::job::JobRecord;
use crate::plugins::{GresPlugin, StepGres};
use crate::step::TaskDist;
use crate::stepmgr::error::StepError;
use crate::ALL_NODES;

/// Mutable working copy of the request fields the picker may rewrite
/// (memory coercion, derived node counts, distribution downgrade).  The
/// create path reads the final values back after picking.
#[derive(Debug, Clone)]
pub(crate) struct PickSpec {
    /// [`ALL_NODES`] = every available job node.
    pub min_nodes: u32,
    /// 0 = no upper bound.
    pub max_nodes: u32,
    /// 0 = no task target.
    pub num_tasks: u32,
    /// 0 = unspecified.
    pub cpu_count: u32,
    pub mem_per_cpu: u64,
    pub node_list: Option<String>,
    pub relative: Option<u32>,
    pub task_dist: TaskDist,
    pub exclusive: bool,
}

/// Picker result: the chosen nodes and, when memory/GRES constraints were
/// in play, the per-node usable-CPU vector (cluster-indexed) the layout
/// stage consumes.
#[derive(Debug, PartialEq)]
pub(crate) struct PickOutcome {
    pub picked: Bitmap,
    pub usable_cpu_cnt: Option<Vec<u32>>,
}

pub(crate) fn pick_step_nodes(
    job: &mut JobRecord,
    spec: &mut PickSpec,
    step_gres: Option<&StepGres>,
    cpus_per_task: u32,
    inventory: &NodeInventory,
    config: &StepmgrConfig,
    gres: &dyn GresPlugin,
    now: u64,
) -> Result<PickOutcome, StepError> {
    if job.node_bitmap.is_empty() {
        return Err(StepError::ConfigUnavailable);
    }
    if spec.max_nodes != 0 && spec.max_nodes < spec.min_nodes {
        return Err(StepError::InvalidNodeCount {
            min_nodes: spec.min_nodes,
            max_nodes: spec.max_nodes,
        });
    }

    let up = inventory.up_bitmap();
    let mut nodes_avail = job.node_bitmap.clone();
    nodes_avail.and(&up);

    if spec.mem_per_cpu > 0 && !job.resources.has_memory() {
        error!(
            job_id = job.job_id,
            "job lacks memory allocation details to enforce memory limits"
        );
        spec.mem_per_cpu = 0;
    }

    // The job's first step requires every allocated node to be up and
    // responsive; a booting node defers the request and buys boot time.
    if job.next_step_id == 0 {
        if job.prolog_running {
            return Err(StepError::PrologRunning);
        }
        for i in job.node_bitmap.iter_set() {
            let node = inventory.node(i);
            if node.power_save || node.no_respond {
                info!(
                    job_id = job.job_id,
                    node = %node.name,
                    "node still booting, deferring first step"
                );
                if let Some(limit) = job.time_limit {
                    job.end_time = now + limit as u64 * 60;
                }
                return Err(StepError::NodesBusy);
            }
        }
        if job.configuring {
            job.configuring = false;
            debug!(job_id = job.job_id, "configuration complete");
        }
    }

    if spec.exclusive {
        return pick_exclusive(
            job,
            spec,
            step_gres,
            cpus_per_task,
            inventory,
            gres,
            nodes_avail,
            &up,
        );
    }

    // ── usable-CPU derivation (memory / GRES constraints) ─────────────────────
    let mut usable_cpu_cnt: Option<Vec<u32>> = None;
    // dropped nodes whose "debits ignored" capacity could still run tasks
    // (transient) vs nodes that can never run them (permanent)
    let mut busy_blocked_nodes = 0u32;
    let mut busy_blocked_cpus = 0u32;
    let mut dead_blocked_nodes = 0u32;
    let mut dead_blocked_cpus = 0u32;
    let mut fail_mode = StepError::InvalidTaskMemory;

    if spec.mem_per_cpu > 0 || step_gres.is_some() {
        let mut ucc = vec![0u32; inventory.len()];
        let resrcs = &job.resources;
        for (node_inx, i) in resrcs.node_bitmap.iter_set().enumerate() {
            if !nodes_avail.test(i) {
                continue; // node now DOWN
            }
            let mut total_cpus = resrcs.cpus[node_inx];
            let mut avail_cpus = total_cpus;
            ucc[i] = avail_cpus;

            if spec.mem_per_cpu > 0 {
                if let (Some(alloc), Some(used)) =
                    (&resrcs.memory_allocated, &resrcs.memory_used)
                {
                    // ignore current step allocations
                    let tmp_cpus = (alloc[node_inx] / spec.mem_per_cpu).min(u32::MAX as u64) as u32;
                    total_cpus = total_cpus.min(tmp_cpus);
                    // consider current step allocations
                    let free_mem = alloc[node_inx].saturating_sub(used[node_inx]);
                    let tmp_cpus = (free_mem / spec.mem_per_cpu).min(u32::MAX as u64) as u32;
                    if tmp_cpus < avail_cpus {
                        avail_cpus = tmp_cpus;
                        ucc[i] = avail_cpus;
                        fail_mode = StepError::InvalidTaskMemory;
                    }
                }
            }

            if step_gres.is_some() {
                // ignore current step allocations
                let tmp_cpus = gres.step_test(step_gres, node_inx, true, job.job_id, None);
                total_cpus = total_cpus.min(tmp_cpus);
                // consider current step allocations
                let tmp_cpus = gres.step_test(step_gres, node_inx, false, job.job_id, None);
                if tmp_cpus < avail_cpus {
                    avail_cpus = tmp_cpus;
                    ucc[i] = avail_cpus;
                    fail_mode = StepError::InvalidGres;
                }
            }

            let (avail_tasks, total_tasks) = if cpus_per_task > 0 {
                (avail_cpus / cpus_per_task, total_cpus / cpus_per_task)
            } else {
                (avail_cpus, total_cpus)
            };
            if avail_tasks == 0 {
                if spec.min_nodes == ALL_NODES {
                    return Err(if total_tasks == 0 {
                        fail_mode
                    } else {
                        StepError::NodesBusy
                    });
                }
                nodes_avail.clear(i);
                if total_tasks == 0 {
                    dead_blocked_nodes += 1;
                    dead_blocked_cpus += total_cpus.saturating_sub(avail_cpus);
                } else {
                    busy_blocked_nodes += 1;
                    busy_blocked_cpus += total_cpus.saturating_sub(avail_cpus);
                }
            }
        }
        usable_cpu_cnt = Some(ucc);
    }

    if spec.min_nodes == ALL_NODES {
        return Ok(PickOutcome {
            picked: nodes_avail,
            usable_cpu_cnt,
        });
    }

    // ── named node list ───────────────────────────────────────────────────────
    let mut nodes_picked = Bitmap::new(nodes_avail.size());
    if let Some(list) = spec.node_list.clone() {
        debug!(node_list = %list, "selected nodelist");
        let Some(selected) = inventory.names_to_bitmap(&list) else {
            info!(node_list = %list, "invalid node list for job step");
            return Err(StepError::ConfigUnavailable);
        };
        if !selected.is_subset_of(&job.node_bitmap) {
            info!(
                node_list = %list,
                job_id = job.job_id,
                "requested nodes not part of job"
            );
            return Err(StepError::ConfigUnavailable);
        }
        if !selected.is_subset_of(&nodes_avail) {
            info!(node_list = %list, "requested nodes have inadequate memory");
            return Err(StepError::InvalidTaskMemory);
        }

        let selected = if spec.task_dist == TaskDist::Arbitrary
            && config.arbitrary_dist == ArbitraryDistPolicy::Downgrade
        {
            // legacy interconnect cannot run arbitrary layouts
            info!("switch type cannot run an arbitrary task layout, using block");
            spec.node_list = None;
            spec.task_dist = TaskDist::Block;
            spec.min_nodes = nodes_avail.count() as u32;
            None
        } else {
            if spec.task_dist == TaskDist::Arbitrary {
                spec.min_nodes = selected.count() as u32;
            }
            Some(selected)
        };

        if let Some(selected) = selected {
            let node_cnt = if spec.min_nodes > 0 || spec.max_nodes > 0 {
                selected.count() as u32
            } else {
                0
            };
            if spec.max_nodes > 0 && node_cnt > spec.max_nodes {
                info!(
                    node_list = %list,
                    job_id = job.job_id,
                    "requested nodes exceed max node count for job step"
                );
                return Err(StepError::ConfigUnavailable);
            } else if spec.min_nodes > 0 && node_cnt > spec.min_nodes {
                // more named than requested: pick from the named pool below
                nodes_avail = selected;
            } else {
                nodes_picked = selected.clone();
                nodes_avail.and_not(&selected);
            }
        }
    }

    // ── relative offset vs idle-first preference ──────────────────────────────
    let mut nodes_idle: Option<Bitmap> = None;
    if let Some(relative) = spec.relative {
        // drop the first `relative` available nodes
        match nodes_avail.pick_cnt(relative as usize) {
            Some(relative_nodes) => nodes_avail.and_not(&relative_nodes),
            None => {
                info!(
                    relative,
                    job_id = job.job_id,
                    "invalid relative value for job"
                );
                return Err(StepError::ConfigUnavailable);
            }
        }
    } else {
        let mut idle = nodes_avail.clone();
        idle.and_not(&job.steps_node_union());
        nodes_idle = Some(idle);
    }

    debug!(
        min_nodes = spec.min_nodes,
        max_nodes = spec.max_nodes,
        avail = %nodes_avail.to_range_fmt(),
        idle = %nodes_idle.as_ref().map(|b| b.to_range_fmt()).unwrap_or_default(),
        "step pick"
    );

    // homogeneous allocation: translate a bare CPU count to a node count
    if spec.cpu_count > 0 && job.resources.homogeneous() {
        let cpus_per_node = job.resources.cpu_array_value[0];
        let derived = (spec.cpu_count + cpus_per_node - 1) / cpus_per_node;
        spec.min_nodes = spec.min_nodes.max(derived);
        if spec.max_nodes > 0 && spec.max_nodes < spec.min_nodes {
            info!(
                job_id = job.job_id,
                "step max node count incompatible with CPU count"
            );
            return Err(StepError::TooManyRequestedCpus);
        }
        // cpu_count is preserved; the CPU top-up below still runs
    }

    // ── satisfy min_nodes: idle nodes first, then any available ───────────────
    let mut nodes_picked_cnt = nodes_picked.count() as u32;
    if spec.min_nodes > 0 {
        if let Some(idle) = &mut nodes_idle {
            if idle.count() as u32 >= spec.min_nodes && spec.min_nodes > nodes_picked_cnt {
                if let Some(node_tmp) =
                    idle.pick_cnt((spec.min_nodes - nodes_picked_cnt) as usize)
                {
                    nodes_picked.or(&node_tmp);
                    idle.and_not(&node_tmp);
                    nodes_avail.and_not(&node_tmp);
                    nodes_picked_cnt = spec.min_nodes;
                }
            }
        }
        if spec.min_nodes > nodes_picked_cnt {
            match nodes_avail.pick_cnt((spec.min_nodes - nodes_picked_cnt) as usize) {
                Some(node_tmp) => {
                    nodes_picked.or(&node_tmp);
                    nodes_avail.and_not(&node_tmp);
                    nodes_picked_cnt = spec.min_nodes;
                }
                None => {
                    return Err(classify_node_shortfall(
                        job,
                        &up,
                        spec.min_nodes,
                        nodes_avail.count() as u32 + nodes_picked_cnt,
                        busy_blocked_nodes,
                        dead_blocked_nodes,
                        fail_mode,
                    ));
                }
            }
        }
    }

    // ── satisfy cpu_count: pull one node at a time ────────────────────────────
    if spec.cpu_count > 0 {
        let mut cpus_picked_cnt = count_cpus(job, &nodes_picked, usable_cpu_cnt.as_deref());
        if spec.cpu_count > cpus_picked_cnt
            && (spec.max_nodes == 0 || spec.max_nodes > nodes_picked_cnt)
        {
            while spec.cpu_count > cpus_picked_cnt {
                let Some(node_tmp) = nodes_avail.pick_cnt(1) else {
                    break;
                };
                let cpu_cnt = count_cpus(job, &node_tmp, usable_cpu_cnt.as_deref());
                if cpu_cnt == 0 {
                    // node not usable (memory/GRES dead)
                    nodes_avail.and_not(&node_tmp);
                    continue;
                }
                nodes_picked.or(&node_tmp);
                nodes_avail.and_not(&node_tmp);
                nodes_picked_cnt += 1;
                if spec.min_nodes > 0 {
                    spec.min_nodes = nodes_picked_cnt;
                }
                cpus_picked_cnt += cpu_cnt;
                if spec.max_nodes > 0 && nodes_picked_cnt >= spec.max_nodes {
                    break;
                }
            }
        }

        if spec.cpu_count > cpus_picked_cnt {
            let err = if spec.cpu_count <= cpus_picked_cnt + busy_blocked_cpus {
                StepError::NodesBusy
            } else if spec.cpu_count <= cpus_picked_cnt + busy_blocked_cpus + dead_blocked_cpus {
                fail_mode
            } else if !job.node_bitmap.is_subset_of(&up) {
                StepError::NodeNotAvail
            } else {
                StepError::ConfigUnavailable
            };
            debug!(
                nodes = nodes_picked_cnt,
                cpus = cpus_picked_cnt,
                requested = spec.cpu_count,
                "picked nodes hold fewer cpus than requested, aborting"
            );
            return Err(err);
        }
    }

    Ok(PickOutcome {
        picked: nodes_picked,
        usable_cpu_cnt,
    })
}

/// Exclusive mode: satisfy the task count from CPUs no other step holds.
/// Nodes with no unused CPUs (or insufficient unused memory/GRES) are
/// skipped.
#[allow(clippy::too_many_arguments)]
fn pick_exclusive(
    job: &JobRecord,
    spec: &mut PickSpec,
    step_gres: Option<&StepGres>,
    cpus_per_task: u32,
    inventory: &NodeInventory,
    gres: &dyn GresPlugin,
    mut nodes_avail: Bitmap,
    up: &Bitmap,
) -> Result<PickOutcome, StepError> {
    let resrcs = &job.resources;

    let selected_nodes = match &spec.node_list {
        Some(list) => {
            let Some(selected) = inventory.names_to_bitmap(list) else {
                info!(node_list = %list, "invalid node list for job step");
                return Err(StepError::ConfigUnavailable);
            };
            if !selected.is_subset_of(&job.node_bitmap) {
                info!(node_list = %list, job_id = job.job_id, "selected nodes not in job");
                return Err(StepError::ConfigUnavailable);
            }
            if !selected.is_subset_of(up) {
                info!(node_list = %list, "selected nodes are DOWN");
                return Err(StepError::ConfigUnavailable);
            }
            Some(selected)
        }
        None => None,
    };

    let mut nodes_picked_cnt = 0u32;
    let mut tasks_picked_cnt = 0u64;
    let mut total_task_cnt = 0u64;

    for (node_inx, i) in resrcs.node_bitmap.iter_set().enumerate() {
        if !nodes_avail.test(i) {
            continue; // node now DOWN
        }
        let avail_cpus = resrcs.cpus[node_inx].saturating_sub(resrcs.cpus_used[node_inx]);
        let total_cpus = resrcs.cpus[node_inx];
        let (mut avail_tasks, mut total_tasks) = if cpus_per_task > 0 {
            (
                (avail_cpus / cpus_per_task) as u64,
                (total_cpus / cpus_per_task) as u64,
            )
        } else {
            (spec.num_tasks as u64, spec.num_tasks as u64)
        };

        if spec.mem_per_cpu > 0 {
            if let (Some(alloc), Some(used)) = (&resrcs.memory_allocated, &resrcs.memory_used) {
                let avail_mem = alloc[node_inx].saturating_sub(used[node_inx]);
                let mut task_cnt = avail_mem / spec.mem_per_cpu;
                if cpus_per_task > 0 {
                    task_cnt /= cpus_per_task as u64;
                }
                avail_tasks = avail_tasks.min(task_cnt);

                let mut task_cnt = alloc[node_inx] / spec.mem_per_cpu;
                if cpus_per_task > 0 {
                    task_cnt /= cpus_per_task as u64;
                }
                total_tasks = total_tasks.min(task_cnt);
            }
        }

        let mut gres_cnt = gres.step_test(step_gres, node_inx, false, job.job_id, None) as u64;
        if cpus_per_task > 0 {
            gres_cnt /= cpus_per_task as u64;
        }
        avail_tasks = avail_tasks.min(gres_cnt);
        let mut gres_cnt = gres.step_test(step_gres, node_inx, true, job.job_id, None) as u64;
        if cpus_per_task > 0 {
            gres_cnt /= cpus_per_task as u64;
        }
        total_tasks = total_tasks.min(gres_cnt);

        if spec.max_nodes > 0 && nodes_picked_cnt >= spec.max_nodes {
            nodes_avail.clear(i);
        } else if avail_tasks == 0
            || (selected_nodes.is_none()
                && nodes_picked_cnt >= spec.min_nodes
                && tasks_picked_cnt > 0
                && tasks_picked_cnt >= spec.num_tasks as u64)
        {
            nodes_avail.clear(i);
            total_task_cnt += total_tasks;
        } else {
            nodes_picked_cnt += 1;
            tasks_picked_cnt += avail_tasks;
            total_task_cnt += total_tasks;
        }
    }

    if let Some(selected) = &selected_nodes {
        if *selected != nodes_avail {
            // some required nodes have no available processors, defer
            tasks_picked_cnt = 0;
        }
    }

    if tasks_picked_cnt >= spec.num_tasks as u64 {
        return Ok(PickOutcome {
            picked: nodes_avail,
            usable_cpu_cnt: None,
        });
    }
    Err(if total_task_cnt >= spec.num_tasks as u64 {
        StepError::NodesBusy
    } else {
        StepError::ConfigUnavailable
    })
}

/// How many CPUs this job supplies on the nodes of `bitmap`, honouring the
/// memory/GRES-derived caps when they were computed.
pub(crate) fn count_cpus(job: &JobRecord, bitmap: &Bitmap, usable_cpu_cnt: Option<&[u32]>) -> u32 {
    let resrcs = &job.resources;
    let mut sum = 0u32;
    for (node_inx, i) in resrcs.node_bitmap.iter_set().enumerate() {
        if !job.node_bitmap.test(i) || !bitmap.test(i) {
            continue; // absent from current job or step bitmap
        }
        sum += match usable_cpu_cnt {
            Some(ucc) => ucc[i],
            None => resrcs.cpus[node_inx],
        };
    }
    sum
}

fn classify_node_shortfall(
    job: &JobRecord,
    up: &Bitmap,
    min_nodes: u32,
    reachable: u32,
    busy_blocked_nodes: u32,
    dead_blocked_nodes: u32,
    fail_mode: StepError,
) -> StepError {
    if min_nodes <= reachable + busy_blocked_nodes {
        StepError::NodesBusy
    } else if min_nodes <= reachable + busy_blocked_nodes + dead_blocked_nodes {
        fail_mode
    } else if !job.node_bitmap.is_subset_of(up) {
        StepError::NodeNotAvail
    } else {
        StepError::ConfigUnavailable
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
