/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Step layout: map tasks onto the picked nodes.
//!
//! Builds run-length-encoded `cpus_per_node[]` / `cpu_count_reps[]` arrays
//! over the step's nodes (consecutive nodes with identical usable CPU
//! counts share a run), then places `num_tasks` under the requested
//! distribution policy.  The usable count per node folds in the exclusive
//! flag, free memory, and GRES availability so later stages never re-derive
//! them.

use tracing::{debug, error, info};

use crate::bitmap::Bitmap;
use crate::cluster::NodeInventory;
use crate::job::JobRecord;
use crate::plugins::{GresPlugin, StepGres};
use crate::step::{StepLayout, TaskDist};
use crate::stepmgr::error::StepError;

/// Everything the layout computation reads.  The step record is not built
/// yet when this runs, so the relevant fields travel individually.
pub(crate) struct LayoutParams<'a> {
    pub job: &'a JobRecord,
    pub inventory: &'a NodeInventory,
    pub gres: &'a dyn GresPlugin,
    pub mem_reserved: bool,
    pub step_node_bitmap: &'a Bitmap,
    pub step_gres: Option<&'a StepGres>,
    pub exclusive: bool,
    pub mem_per_cpu: u64,
    pub cpus_per_task: u32,
    pub step_id: u32,
    /// Step node names; caller order for arbitrary distribution (possibly
    /// with duplicates), bit-index ascending otherwise.
    pub node_list: &'a str,
    pub node_count: u32,
    pub num_tasks: u32,
    pub task_dist: TaskDist,
    pub plane_size: u32,
}

/// Build the per-node task layout for a step.
pub(crate) fn step_layout_create(p: &LayoutParams<'_>) -> Result<StepLayout, StepError> {
    let resrcs = &p.job.resources;

    let mut mem_per_cpu = p.mem_per_cpu;
    if mem_per_cpu > 0 && p.mem_reserved && !resrcs.has_memory() {
        error!(
            job_id = p.job.job_id,
            "job lacks memory allocation details to enforce memory limits"
        );
        mem_per_cpu = 0;
    }

    // usable CPUs for the subset of nodes used by this step, plus the RLE
    // runs handed to the distribution stage
    let mut usable: Vec<u32> = Vec::with_capacity(p.node_count as usize);
    let mut cpus_per_node: Vec<u32> = Vec::new();
    let mut cpu_count_reps: Vec<u32> = Vec::new();
    let mut job_node_offset = 0usize;

    for cluster_inx in p.job.node_bitmap.iter_set() {
        let offset = job_node_offset;
        job_node_offset += 1;
        if !p.step_node_bitmap.test(cluster_inx) {
            continue;
        }
        let pos = match resrcs.node_inx(cluster_inx) {
            Some(pos) => pos,
            None => return Err(StepError::ConfigUnavailable),
        };

        let mut usable_cpus = if p.exclusive {
            resrcs.cpus[pos].saturating_sub(resrcs.cpus_used[pos]) as u64
        } else {
            resrcs.cpus[pos] as u64
        };
        if mem_per_cpu > 0 && p.mem_reserved {
            if let (Some(alloc), Some(used)) = (&resrcs.memory_allocated, &resrcs.memory_used) {
                let usable_mem = alloc[pos].saturating_sub(used[pos]) / mem_per_cpu;
                usable_cpus = usable_cpus.min(usable_mem);
            }
        }
        let gres_cpus = p.gres.step_test(
            p.step_gres,
            offset,
            false,
            p.job.job_id,
            Some(p.step_id),
        );
        usable_cpus = usable_cpus.min(gres_cpus as u64);

        if usable_cpus == 0 {
            error!(
                job_id = p.job.job_id,
                step_id = p.step_id,
                node = p.inventory.name(cluster_inx),
                "step layout has no usable cpus on node"
            );
            return Err(StepError::ConfigUnavailable);
        }
        debug!(
            node = p.inventory.name(cluster_inx),
            usable_cpus, "step layout node capacity"
        );

        let usable_cpus = usable_cpus.min(u32::MAX as u64) as u32;
        usable.push(usable_cpus);
        match cpus_per_node.last() {
            Some(&last) if last == usable_cpus => *cpu_count_reps.last_mut().unwrap() += 1,
            _ => {
                cpus_per_node.push(usable_cpus);
                cpu_count_reps.push(1);
            }
        }
        if usable.len() == p.node_count as usize {
            break;
        }
    }

    if usable.len() != p.node_count as usize {
        return Err(StepError::ConfigUnavailable);
    }

    // task capacity per node before overcommit kicks in
    let cpt = p.cpus_per_task.max(1);
    let cap: Vec<u32> = usable.iter().map(|&c| c / cpt).collect();

    let tasks = match p.task_dist {
        TaskDist::Arbitrary => {
            layout_arbitrary(p.inventory, p.step_node_bitmap, p.node_list, p.num_tasks)?
        }
        TaskDist::Plane => layout_plane(&cap, p.num_tasks, p.plane_size.max(1)),
        dist if dist.node_level_cyclic() => layout_cyclic(&cap, p.num_tasks),
        _ => layout_block(&cap, p.num_tasks),
    };

    info!(
        job_id = p.job.job_id,
        step_id = p.step_id,
        node_cnt = p.node_count,
        task_cnt = p.num_tasks,
        tasks = ?tasks,
        "step layout built"
    );

    Ok(StepLayout {
        node_list: p.node_list.to_string(),
        node_cnt: p.node_count,
        tasks,
        task_cnt: p.num_tasks,
    })
}

// ── Distribution policies ─────────────────────────────────────────────────────

/// One task per node round-robin while capacity lasts, then keep cycling
/// regardless of capacity (declared overcommit).
fn layout_cyclic(cap: &[u32], num_tasks: u32) -> Vec<u32> {
    let mut tasks = vec![0u32; cap.len()];
    let mut remaining = num_tasks;

    'capacity: loop {
        let mut placed_any = false;
        for (inx, t) in tasks.iter_mut().enumerate() {
            if remaining == 0 {
                break 'capacity;
            }
            if *t < cap[inx] {
                *t += 1;
                remaining -= 1;
                placed_any = true;
            }
        }
        if !placed_any {
            break;
        }
    }
    overflow_round_robin(&mut tasks, remaining);
    tasks
}

/// Fill each node to capacity in order, then spread the overflow one task
/// per node.
fn layout_block(cap: &[u32], num_tasks: u32) -> Vec<u32> {
    let mut tasks = vec![0u32; cap.len()];
    let mut remaining = num_tasks;

    for (inx, t) in tasks.iter_mut().enumerate() {
        let take = remaining.min(cap[inx]);
        *t = take;
        remaining -= take;
        if remaining == 0 {
            break;
        }
    }
    overflow_round_robin(&mut tasks, remaining);
    tasks
}

/// Blocks of `plane_size` tasks per node round-robin, capacity-aware first,
/// then regardless of capacity.
fn layout_plane(cap: &[u32], num_tasks: u32, plane_size: u32) -> Vec<u32> {
    let mut tasks = vec![0u32; cap.len()];
    let mut remaining = num_tasks;

    'capacity: loop {
        let mut placed_any = false;
        for (inx, t) in tasks.iter_mut().enumerate() {
            if remaining == 0 {
                break 'capacity;
            }
            let room = cap[inx].saturating_sub(*t);
            let take = plane_size.min(room).min(remaining);
            if take > 0 {
                *t += take;
                remaining -= take;
                placed_any = true;
            }
        }
        if !placed_any {
            break;
        }
    }
    while remaining > 0 {
        for t in tasks.iter_mut() {
            let take = plane_size.min(remaining);
            *t += take;
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
    }
    tasks
}

/// Arbitrary distribution: each occurrence of a node name in the caller's
/// list is one task, honoured verbatim.
fn layout_arbitrary(
    inventory: &NodeInventory,
    step_node_bitmap: &Bitmap,
    node_list: &str,
    num_tasks: u32,
) -> Result<Vec<u32>, StepError> {
    let names: Vec<&str> = node_list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if names.len() != num_tasks as usize {
        error!(
            names = names.len(),
            num_tasks, "arbitrary layout task count does not match node list"
        );
        return Err(StepError::BadTaskCount);
    }

    let mut tasks = vec![0u32; step_node_bitmap.count()];
    for name in names {
        let cluster_inx = inventory.find(name).ok_or(StepError::BadTaskCount)?;
        let step_inx = step_node_bitmap
            .position_of(cluster_inx)
            .ok_or(StepError::BadTaskCount)?;
        tasks[step_inx] += 1;
    }
    Ok(tasks)
}

fn overflow_round_robin(tasks: &mut [u32], mut remaining: u32) {
    while remaining > 0 {
        for t in tasks.iter_mut() {
            if remaining == 0 {
                break;
            }
            *t += 1;
            remaining -= 1;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_spreads_one_per_node_per_round() {
        assert_eq!(layout_cyclic(&[4, 4], 4), vec![2, 2]);
        assert_eq!(layout_cyclic(&[4, 4], 3), vec![2, 1]);
        assert_eq!(layout_cyclic(&[1, 4], 4), vec![1, 3]);
    }

    #[test]
    fn cyclic_overcommits_round_robin_past_capacity() {
        assert_eq!(layout_cyclic(&[4, 4], 16), vec![8, 8]);
        assert_eq!(layout_cyclic(&[2, 0], 3), vec![3, 0]);
    }

    #[test]
    fn block_fills_in_order_then_wraps() {
        assert_eq!(layout_block(&[4, 4], 4), vec![4, 0]);
        assert_eq!(layout_block(&[4, 4], 6), vec![4, 2]);
        assert_eq!(layout_block(&[4, 4], 10), vec![5, 5]);
    }

    #[test]
    fn plane_places_whole_blocks() {
        assert_eq!(layout_plane(&[4, 4], 8, 2), vec![4, 4]);
        assert_eq!(layout_plane(&[4, 4], 6, 4), vec![4, 2]);
        // overcommit: capacity exhausted, blocks keep cycling
        assert_eq!(layout_plane(&[2, 2], 8, 2), vec![4, 4]);
    }

    #[test]
    fn arbitrary_counts_each_occurrence() {
        let inventory = NodeInventory::all_up(&["n0", "n1", "n2"]);
        let mut bm = Bitmap::new(3);
        bm.set(0);
        bm.set(2);
        let tasks = layout_arbitrary(&inventory, &bm, "n2,n0,n2", 3).unwrap();
        assert_eq!(tasks, vec![1, 2]);
    }

    #[test]
    fn arbitrary_rejects_count_mismatch() {
        let inventory = NodeInventory::all_up(&["n0", "n1"]);
        let mut bm = Bitmap::new(2);
        bm.set(0);
        assert_eq!(
            layout_arbitrary(&inventory, &bm, "n0,n0", 3),
            Err(StepError::BadTaskCount)
        );
    }

    #[test]
    fn arbitrary_rejects_node_outside_step() {
        let inventory = NodeInventory::all_up(&["n0", "n1"]);
        let mut bm = Bitmap::new(2);
        bm.set(0);
        assert_eq!(
            layout_arbitrary(&inventory, &bm, "n1", 1),
            Err(StepError::BadTaskCount)
        );
    }
}
