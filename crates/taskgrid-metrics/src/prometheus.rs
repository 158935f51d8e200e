//! Prometheus text exposition format.

use std::fmt::Write;

use crate::collector::PoolMetrics;

/// Render pool metrics in the Prometheus text exposition format.
pub fn render_prometheus(m: &PoolMetrics) -> String {
    let mut out = String::new();

    gauge(&mut out, "taskgrid_utilization", "Bottleneck resource utilization (0.0-1.0).", format!("{:.4}", m.utilization));
    gauge(&mut out, "taskgrid_queue_depth", "Pending tasks whose dependencies are satisfied.", m.queue_depth.to_string());
    gauge(&mut out, "taskgrid_agents", "Registered agents.", m.agents.to_string());
    gauge(&mut out, "taskgrid_schedulable_agents", "Agents that may receive new work.", m.schedulable_agents.to_string());

    counter(&mut out, "taskgrid_assignments_total", "Tasks assigned to agents.", m.assignments_total);
    counter(&mut out, "taskgrid_completions_total", "Tasks completed.", m.completions_total);
    counter(&mut out, "taskgrid_failures_total", "Tasks failed terminally.", m.failures_total);
    counter(&mut out, "taskgrid_requeues_total", "Tasks returned to the queue for retry.", m.requeues_total);
    counter(&mut out, "taskgrid_unhealthy_total", "Agents marked unhealthy.", m.unhealthy_total);
    counter(&mut out, "taskgrid_scaling_decisions_total", "Scaling decisions made.", m.scaling_decisions_total);

    out.push_str("# HELP taskgrid_assignment_latency_ms Time from eligible to assigned, in milliseconds.\n");
    out.push_str("# TYPE taskgrid_assignment_latency_ms summary\n");
    let _ = writeln!(out, "taskgrid_assignment_latency_ms{{quantile=\"0.5\"}} {:.2}", m.latency_p50_ms);
    let _ = writeln!(out, "taskgrid_assignment_latency_ms{{quantile=\"0.99\"}} {:.2}", m.latency_p99_ms);
    let _ = writeln!(out, "taskgrid_assignment_latency_ms_count {}", m.latency_samples);

    out
}

fn gauge(out: &mut String, name: &str, help: &str, value: String) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}
