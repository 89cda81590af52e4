//! Prometheus text exposition format.
//!
//! Renders a point-in-time view of the control plane (workloads by state,
//! open sessions by kind, quota usage per principal, machine health) for
//! scraping by a Prometheus server or compatible agent.

use std::collections::BTreeMap;

use skiff_health::MachineStatus;
use skiff_quota::{QuotaReport, QuotaSubject};
use skiff_session::SessionKind;
use skiff_state::{WorkloadFilter, WorkloadState};

use crate::ApiState;
use crate::error::ApiResult;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Everything one scrape reports.
#[derive(Debug, Clone, Default)]
pub struct ControlPlaneSnapshot {
    pub workloads: Vec<(WorkloadState, usize)>,
    pub sessions: BTreeMap<SessionKind, usize>,
    pub quotas: Vec<QuotaReport>,
    pub machines: Vec<(MachineStatus, usize)>,
}

impl ControlPlaneSnapshot {
    pub fn collect(state: &ApiState) -> ApiResult<Self> {
        let all = state.orchestrator.repo().list_workloads(&WorkloadFilter {
            include_deleted: true,
            ..Default::default()
        })?;
        let workloads = WorkloadState::ALL
            .iter()
            .map(|s| (*s, all.iter().filter(|w| w.state == *s).count()))
            .collect();

        let machines = state.health.list();
        let machines = [
            MachineStatus::Healthy,
            MachineStatus::Degraded,
            MachineStatus::Unreachable,
        ]
        .iter()
        .map(|s| (*s, machines.iter().filter(|m| m.status == *s).count()))
        .collect();

        let quotas = state
            .quota()
            .reports()
            .into_iter()
            .filter(|r| matches!(r.subject, QuotaSubject::Principal(_)))
            .collect();

        Ok(Self {
            workloads,
            sessions: state.sessions.registry().counts(),
            quotas,
            machines,
        })
    }
}

/// Render a snapshot into Prometheus text format. Every metric is a gauge.
pub fn render_prometheus(snapshot: &ControlPlaneSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP skiff_workloads Workload records by lifecycle state.\n");
    out.push_str("# TYPE skiff_workloads gauge\n");
    for (state, count) in &snapshot.workloads {
        out.push_str(&format!("skiff_workloads{{state=\"{state}\"}} {count}\n"));
    }

    out.push_str("# HELP skiff_sessions_open Open sessions by kind.\n");
    out.push_str("# TYPE skiff_sessions_open gauge\n");
    for (kind, count) in &snapshot.sessions {
        out.push_str(&format!(
            "skiff_sessions_open{{kind=\"{}\"}} {count}\n",
            kind.as_str()
        ));
    }

    out.push_str("# HELP skiff_quota_workloads Workloads reserved per principal.\n");
    out.push_str("# TYPE skiff_quota_workloads gauge\n");
    for (principal, r) in principals(&snapshot.quotas) {
        out.push_str(&format!(
            "skiff_quota_workloads{{principal=\"{}\"}} {}\n",
            escape(principal),
            r.usage.workloads
        ));
    }

    out.push_str("# HELP skiff_quota_cpu_millis CPU reserved per principal, in millicores.\n");
    out.push_str("# TYPE skiff_quota_cpu_millis gauge\n");
    for (principal, r) in principals(&snapshot.quotas) {
        out.push_str(&format!(
            "skiff_quota_cpu_millis{{principal=\"{}\"}} {}\n",
            escape(principal),
            r.usage.resources.cpu_millis
        ));
    }

    out.push_str("# HELP skiff_quota_memory_mb Memory reserved per principal, in MiB.\n");
    out.push_str("# TYPE skiff_quota_memory_mb gauge\n");
    for (principal, r) in principals(&snapshot.quotas) {
        out.push_str(&format!(
            "skiff_quota_memory_mb{{principal=\"{}\"}} {}\n",
            escape(principal),
            r.usage.resources.memory_mb
        ));
    }

    out.push_str("# HELP skiff_quota_gpus GPUs reserved per principal.\n");
    out.push_str("# TYPE skiff_quota_gpus gauge\n");
    for (principal, r) in principals(&snapshot.quotas) {
        out.push_str(&format!(
            "skiff_quota_gpus{{principal=\"{}\"}} {}\n",
            escape(principal),
            r.usage.resources.gpus
        ));
    }

    out.push_str("# HELP skiff_machines Machines by reported health.\n");
    out.push_str("# TYPE skiff_machines gauge\n");
    for (status, count) in &snapshot.machines {
        out.push_str(&format!(
            "skiff_machines{{status=\"{}\"}} {count}\n",
            status.as_str()
        ));
    }

    out
}

fn principals(reports: &[QuotaReport]) -> impl Iterator<Item = (&str, &QuotaReport)> {
    reports.iter().filter_map(|r| match &r.subject {
        QuotaSubject::Principal(id) => Some((id.as_str(), r)),
        QuotaSubject::Namespace(_) => None,
    })
}

/// Label values may not carry raw quotes, backslashes or newlines.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
