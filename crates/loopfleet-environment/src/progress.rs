// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Progress parsing for remote runner output.
//!
//! The remote runner appends free text to a progress file. This module turns
//! a snapshot of that file into a coarse step on a ten-step scale:
//!
//! | Step | Meaning |
//! |------|---------|
//! | 1 | Initializing (nothing recognized yet) |
//! | 2 | Loading the work spec |
//! | 3 | Picking the first unit |
//! | 4..=9 | Units passing, proportional to passed / known units |
//! | 10 | Complete |
//!
//! The estimate is approximate by construction. Unit ids are only counted once
//! they appear in the output, so the denominator can grow as the run proceeds.
//! The step only ever rises when more passes are reported against the same
//! set of known units.

use std::collections::HashSet;
use std::sync::LazyLock;

use loopfleet_core::DEFAULT_TOTAL_STEPS;
use regex::Regex;

/// Progress text used when the remote side has nothing to report.
pub const NO_PROGRESS: &str = "No progress yet";

const COMPLETION_MARKERS: [&str; 3] = [
    "<promise>COMPLETE</promise>",
    "Execution complete",
    "All user stories completed",
];

const FAILURE_MARKERS: [&str; 2] = ["<promise>FAILED</promise>", "Execution failed"];

const LOADING_MARKER: &str = "Loading prd.json";
const PICKING_MARKER: &str = "Picking user story";

const FIRST_PASS_STEP: i32 = 4;
const LAST_WORKING_STEP: i32 = 9;

static UNIT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"US-\d{3}").expect("unit id pattern is valid"));

static PASSES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"passes:\s*true").expect("pass marker pattern is valid"));

/// Structured view of one progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSignal {
    /// Estimated step, `1..=total_steps`.
    pub current_step: i32,
    /// Scale of `current_step`.
    pub total_steps: i32,
    /// A completion marker is present.
    pub is_complete: bool,
    /// A failure marker is present and no completion marker is.
    pub is_failed: bool,
}

/// Parse a raw progress snapshot.
pub fn parse_progress(raw: &str) -> ProgressSignal {
    let is_complete = is_complete(raw);
    ProgressSignal {
        current_step: if is_complete {
            DEFAULT_TOTAL_STEPS
        } else {
            estimate_step(raw)
        },
        total_steps: DEFAULT_TOTAL_STEPS,
        is_complete,
        is_failed: !is_complete && is_failed(raw),
    }
}

/// Whether the output contains a completion marker.
pub fn is_complete(raw: &str) -> bool {
    COMPLETION_MARKERS.iter().any(|m| raw.contains(m))
}

/// Whether the output contains an explicit failure marker.
pub fn is_failed(raw: &str) -> bool {
    FAILURE_MARKERS.iter().any(|m| raw.contains(m))
}

/// Estimate the current step from unit ids and pass markers.
pub fn estimate_step(raw: &str) -> i32 {
    let passed = PASSES.find_iter(raw).count() as i64;

    if passed == 0 {
        if raw.contains(PICKING_MARKER) {
            return 3;
        }
        if raw.contains(LOADING_MARKER) {
            return 2;
        }
        return 1;
    }

    let units: HashSet<&str> = UNIT_ID.find_iter(raw).map(|m| m.as_str()).collect();
    let known = (units.len() as i64).max(passed);
    let span = (LAST_WORKING_STEP - FIRST_PASS_STEP) as i64;

    let step = FIRST_PASS_STEP as i64 + span * passed / known;
    step.min(LAST_WORKING_STEP as i64) as i32
}

/// The unit id on the most recent line that mentions one.
pub fn current_unit_id(raw: &str) -> Option<&str> {
    raw.lines()
        .rev()
        .find_map(|line| UNIT_ID.find(line).map(|m| m.as_str()))
}
