use crate::output::UserOutput;
use labpool::config::{format_duration, ManagerConfig};
use labpool::{Error as LabError, LabManager, PortRecord, StopOutcome};
use serde_json::json;
use std::path::Path;

pub async fn run_serve(manager: &LabManager, no_pool: bool, out: &dyn UserOutput) -> anyhow::Result<()> {
    if no_pool {
        let report = manager.prepare().await?;
        out.status(&format!(
            "Reconciled: {} stale record(s), {} bound port(s)",
            report.stale_records, report.bound_ports
        ));
    } else {
        let report = manager.initialize().await?;
        out.status(&format!(
            "Reconciled: {} stale record(s), {} bound port(s); {} pool container(s) ready",
            report.reconcile.stale_records, report.reconcile.bound_ports, report.pool_created
        ));
    }

    manager.spawn_reaper();
    out.status("Serving. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    out.blank();
    out.status("Shutting down...");
    manager.shutdown().await;
    Ok(())
}

pub async fn run_assign(
    manager: &LabManager,
    owner: &str,
    scenario: &str,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let info = manager.assign(owner, scenario).await?;
    out.json_or(&info, || {
        out.status(&format!("{} ({:?})", info.name, info.provenance));
        out.status(&format!("  display: {}", info.display_url));
        out.status(&format!("  proxy:   {}", info.proxy_url));
    })
}

pub async fn run_stop(manager: &LabManager, owner: &str, out: &dyn UserOutput) -> anyhow::Result<()> {
    let outcome = manager.stop(owner).await?;
    out.json_or(&outcome, || match &outcome {
        StopOutcome::Stopped { runtime_id } => {
            out.status(&format!("Stopped container {} for {}", runtime_id, owner))
        }
        StopOutcome::NotFound => out.status(&format!("No running container for {}", owner)),
    })
}

pub async fn run_heartbeat(
    manager: &LabManager,
    owner: &str,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    if !manager.heartbeat(owner).await? {
        return Err(LabError::RecordNotFound(format!("no running container for {}", owner)).into());
    }
    out.json_or(&json!({ "owner": owner, "touched": true }), || {
        out.status(&format!("Activity recorded for {}", owner))
    })
}

pub async fn run_lookup(manager: &LabManager, owner: &str, out: &dyn UserOutput) -> anyhow::Result<()> {
    let record = manager.lookup(owner).await?;
    out.json_or(&record, || match &record {
        Some(r) => {
            out.status(&format!("{} ({})", r.name, r.runtime_id));
            out.status(&format!("  ports:         {}/{}", r.display_port, r.proxy_port));
            if let Some(scenario) = &r.scenario_id {
                out.status(&format!("  scenario:      {}", scenario));
            }
            out.status(&format!("  created:       {}", r.created_at));
            out.status(&format!("  last activity: {}", r.last_activity_at));
        }
        None => out.status(&format!("No running container for {}", owner)),
    })
}

pub async fn run_stats(manager: &LabManager, out: &dyn UserOutput) -> anyhow::Result<()> {
    let stats = manager.stats().await?;
    out.json_or(&stats, || {
        out.status(&format!(
            "Containers: {}/{} ({}%)",
            stats.active, stats.max, stats.utilization_percent
        ));
        out.status(&format!("  assigned: {}", stats.assigned()));
        out.status(&format!("  pool:     {}", stats.pool));
    })
}

pub async fn run_ports(manager: &LabManager, allocated: bool, out: &dyn UserOutput) -> anyhow::Result<()> {
    let ports: Vec<PortRecord> = manager
        .ledger()
        .snapshot()
        .await?
        .into_iter()
        .filter(|p| !allocated || !p.is_available)
        .collect();

    out.json_or(&ports, || {
        if ports.is_empty() {
            out.status("No ports to show");
            return;
        }
        out.status(&format!("{:<7} {:<8} {:<10} OWNER", "PORT", "TYPE", "STATE"));
        for p in &ports {
            let state = if p.is_available { "free" } else { "taken" };
            out.status(&format!(
                "{:<7} {:<8} {:<10} {}",
                p.port,
                p.port_type.as_str(),
                state,
                p.allocated_to.as_deref().unwrap_or("-")
            ));
        }
    })
}

pub async fn run_reap(manager: &LabManager, out: &dyn UserOutput) -> anyhow::Result<()> {
    let report = manager.reap_idle().await?;
    out.json_or(&report, || {
        out.status(&format!(
            "Reclaimed {} idle container(s), {} failed",
            report.reclaimed.len(),
            report.failed
        ));
        for owner in &report.reclaimed {
            out.status(&format!("  - {}", owner));
        }
        if report.pruned_records > 0 {
            out.status(&format!("Pruned {} stopped record(s)", report.pruned_records));
        }
    })
}

pub async fn run_reconcile(manager: &LabManager, out: &dyn UserOutput) -> anyhow::Result<()> {
    let report = manager.reconcile_exclusive().await?;
    out.json_or(&report, || {
        out.status(&format!("Stale records cleaned:     {}", report.stale_records));
        out.status(&format!("Bound ports marked:        {}", report.bound_ports));
        out.status(&format!("Records re-stamped:        {}", report.adopted_records));
        out.status(&format!("Leftover pool removed:     {}", report.leftover_pool_removed));
    })
}

pub async fn run_purge_pool(manager: &LabManager, out: &dyn UserOutput) -> anyhow::Result<()> {
    let purged = manager.purge_pool().await?;
    out.json_or(&json!({ "purged": purged }), || {
        out.status(&format!("Purged {} pool container(s)", purged))
    })
}

pub fn run_check_config(
    config: &ManagerConfig,
    source: Option<&Path>,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    out.json_or(config, || {
        match source {
            Some(path) => out.status(&format!("Configuration is valid ({})", path.display())),
            None => out.status("No labpool.yaml found; defaults and environment are valid"),
        }
        out.blank();
        out.status(&format!(
            "Capacity:      {} containers, pool {}",
            config.max_containers, config.pool.size
        ));
        out.status(&format!("Display ports: {}", config.ports.display));
        out.status(&format!("Proxy ports:   {}", config.ports.proxy));
        out.status(&format!(
            "Idle timeout:  {} (sweep every {})",
            format_duration(config.idle.timeout),
            format_duration(config.idle.sweep_interval)
        ));
        out.status(&format!(
            "Sandbox:       {} on {}",
            config.sandbox.image, config.sandbox.network
        ));
        out.status(&format!(
            "Database:      {}",
            config.database.resolved_path().display()
        ));
    })
}
