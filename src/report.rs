//! Human-readable and JSON output for the CLI.
//!
//! Writers take any `impl Write` so tests can capture the output.

use std::io::Write;

use crate::cluster::{ClusterOperation, NodeAction};
use crate::expected;
use crate::scenario::RunReport;

/// Print the outcome of a run.
pub fn write_report(out: &mut impl Write, report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(report)?)?;
        return Ok(());
    }

    writeln!(out, "Fault-injection run")?;
    writeln!(out, "===================")?;
    writeln!(out, "Runner:     {}", report.runner)?;
    writeln!(out, "Seed:       {}", report.seed)?;
    writeln!(
        out,
        "Completed:  {}/{}",
        report.completed.len(),
        report.iterations_requested
    )?;
    writeln!(out)?;

    if !report.completed.is_empty() {
        writeln!(
            out,
            "{:<5} {:<8} {:<12} {:<7} {:<7} {:<9} {:<9} {:>10}  NODES",
            "ITER", "ACTION", "OPERATION", "WIPE?", "WIPED", "DISABLED", "MISSING", "ELAPSED"
        )?;
        writeln!(out, "{}", "-".repeat(90))?;
        for r in &report.completed {
            writeln!(
                out,
                "{:<5} {:<8} {:<12} {:<7} {:<7} {:<9} {:<9} {:>9}s  {}",
                r.iteration,
                r.action.to_string(),
                r.cluster_operation.to_string(),
                r.wipe_expected,
                r.wiped,
                r.counts.disabled,
                r.counts.missing,
                r.elapsed_ms / 1000,
                r.nodes.join(",")
            )?;
        }
        writeln!(out)?;
    }

    match &report.failure {
        None => writeln!(out, "Result: PASSED")?,
        Some(f) if f.iteration == 0 => {
            writeln!(out, "Result: ERROR during {}", f.stage)?;
            writeln!(out, "Reason: {}", f.reason)?;
        }
        Some(f) => {
            let verdict = if f.error.is_check_failure() {
                "FAILED"
            } else {
                "ERROR"
            };
            writeln!(
                out,
                "Result: {verdict} in iteration {} during {}",
                f.iteration, f.stage
            )?;
            writeln!(out, "Reason: {}", f.reason)?;
        }
    }
    Ok(())
}

/// Print the expected membership of an acted-upon node for every action,
/// operation and wipe outcome.
pub fn write_table(out: &mut impl Write, json: bool) -> anyhow::Result<()> {
    let mut rows = Vec::new();
    for action in NodeAction::ALL {
        for op in ClusterOperation::ALL {
            for wiped in [false, true] {
                rows.push((action, op, wiped, expected::expect(action, op, wiped)));
            }
        }
    }

    if json {
        let json_rows: Vec<_> = rows
            .iter()
            .map(|(action, op, wiped, state)| {
                serde_json::json!({
                    "action": action,
                    "cluster_operation": op,
                    "wiped": wiped,
                    "expected": state,
                })
            })
            .collect();
        writeln!(out, "{}", serde_json::to_string_pretty(&json_rows)?)?;
        return Ok(());
    }

    let show = |v: Option<bool>| match v {
        Some(true) => "yes",
        Some(false) => "no",
        None => "-",
    };
    writeln!(
        out,
        "{:<8} {:<12} {:<6} {:<8} {:<8} {:<8}",
        "ACTION", "OPERATION", "WIPED", "PRESENT", "ENABLED", "RUNNING"
    )?;
    writeln!(out, "{}", "-".repeat(55))?;
    for (action, op, wiped, state) in rows {
        writeln!(
            out,
            "{:<8} {:<12} {:<6} {:<8} {:<8} {:<8}",
            action.to_string(),
            op.to_string(),
            wiped,
            show(Some(state.present_in_domain)),
            show(state.enabled),
            show(state.running)
        )?;
    }
    Ok(())
}
