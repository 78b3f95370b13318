/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Tutti-C job step manager (Rust port)
//!
//! In-memory subsystem that admits, places, and accounts for *steps* —
//! sub-allocations inside an already-scheduled job used to launch parallel
//! task groups.  RPC decoding, the parent job scheduler, node-health
//! tracking, and the plugin implementations all live outside this crate and
//! are consumed through the narrow interfaces in [`plugins`] and
//! [`cluster`].
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── bitmap      – packed bit sets (node space, job-global core space)
//! ├── cluster     – read-only node inventory
//! ├── config      – YAML stepmgr configuration
//! ├── plugins     – switch / checkpoint / GRES / accounting / agent traits
//! ├── job         – job record, job resources, per-job step registry
//! ├── step        – step record and step create request
//! └── stepmgr     – the manager: picker, layout, alloc, lifecycle, snapshot
//! ```
//!
//! # Locking model
//! `StepMgr` methods take `&mut self` for every mutation and `&self` for
//! read-only observers; callers serialise through their own job-write lock
//! (typically `RwLock<StepMgr>`).  All operations are therefore linearizable
//! with respect to the step registries, matching the original controller's
//! coarse job lock.

pub mod bitmap;
pub mod cluster;
pub mod config;
pub mod job;
pub mod plugins;
pub mod step;
pub mod stepmgr;

/// Node-count sentinel: "use every node of the job's allocation".
pub const ALL_NODES: u32 = u32::MAX;

/// Step ids at or above this value are reserved for sentinels (batch script
/// id, "all steps", ...).  `next_step_id` reaching it refuses new steps so
/// sentinel ids never reach the accounting database.
pub const MAX_STEP_ID: u32 = 0xffff_fff0;

/// Reserved step id naming a job's batch script in checkpoint requests.
pub const BATCH_SCRIPT_STEP_ID: u32 = 0xffff_fffb;
