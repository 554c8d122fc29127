use crate::config::cli::{Backend, RunOpt};
use anyhow::Context;
use emulated_network::run::{ConvergenceOutcome, LabPlan, RunOutcome};
use emulated_network::topology::{LinkId, NodeRole};
use emulated_network::tunables::Tunables;
use std::error::Error;
use std::path::Path;

pub fn print_params(lab_name: &str, options: &RunOpt, tunables: &Tunables) {
    println!("--- Params ---");
    println!("* Lab: {lab_name} ({})", options.lab.display());
    println!("* Backend: {}", options.backend);
    match options.backend {
        Backend::Netns => println!("* Namespace prefix: {}", options.namespace_prefix),
        Backend::Simulated => println!("* Network seed: {}", options.network_rng_seed),
    }
    print_tunables(tunables);
}

fn print_tunables(tunables: &Tunables) {
    println!(
        "* Convergence: poll every {} ms, give up after {} ms",
        tunables.poll_interval.as_millis(),
        tunables.convergence_timeout.as_millis()
    );
    println!("* Settle delay: {} ms", tunables.settle_delay.as_millis());
    println!(
        "* Probes: {} attempts of at most {} ms, scenarios abort after {} ms",
        tunables.probe_count,
        tunables.probe_timeout.as_millis(),
        tunables.scenario_timeout.as_millis()
    );
    println!(
        "* Throughput: {} ms transfers (tolerance {} ms), servers settle for {} ms",
        tunables.throughput_duration.as_millis(),
        tunables.throughput_tolerance.as_millis(),
        tunables.server_settle.as_millis()
    );
}

pub fn print_plan(plan: &LabPlan) {
    let topology = &plan.topology;
    let count = |role| topology.nodes().iter().filter(|n| n.role() == role).count();

    println!("--- Topology ---");
    println!(
        "* {} nodes: {} switches, {} hosts, {} gateways",
        topology.nodes().len(),
        count(NodeRole::Switch),
        count(NodeRole::Host),
        count(NodeRole::Gateway)
    );
    println!("* Links:");
    for link in topology.links() {
        println!("  * {}: {link} ({})", link.id(), link.shaping());
    }
    println!("* Static addresses:");
    for node in topology.nodes() {
        let addresses: Vec<_> = node.addresses().map(|a| a.to_string()).collect();
        if !addresses.is_empty() {
            println!("  * {}: {}", node.name(), addresses.join(", "));
        }
    }

    if let Some(convergence) = &plan.convergence {
        println!(
            "* Spanning tree root: {} (priority {:#06x}, others {:#06x})",
            convergence.root, convergence.root_priority, convergence.default_priority
        );
    }

    if let Some(gateway) = &plan.gateway {
        println!("--- Gateway ---");
        println!(
            "* {}: public {}, private {} ({})",
            gateway.node, gateway.public_interface, gateway.private_interface, gateway.private_subnet
        );
        println!("* Planned rules:");
        for rule in gateway.rules() {
            println!("  * {rule}");
        }
    }

    for addressing in &plan.addressing {
        for route in &addressing.routes {
            println!("* Route on {}: {route}", addressing.node);
        }
    }

    println!("* Scenarios:");
    for scenario in &plan.scenarios {
        println!("  * {scenario}");
    }
}

pub fn print_outcome(outcome: &RunOutcome) {
    println!("--- Convergence ---");
    match &outcome.convergence {
        None => println!("* Not reached"),
        Some(ConvergenceOutcome::Skipped) => println!("* Skipped (no spanning tree requested)"),
        Some(ConvergenceOutcome::TimedOut(timeout)) => {
            println!("* WARNING: {timeout}");
            println!("* The backbone may still contain loops");
        }
        Some(ConvergenceOutcome::Converged(report)) => {
            let root = report.root.as_deref().unwrap_or("-");
            println!(
                "* Root bridge {root} elected after {:.1} s",
                report.waited.as_secs_f64()
            );
            println!("* Forwarding: {}", link_list(&report.forwarding_links));
            println!("* Blocked: {}", link_list(&report.blocked_links));
        }
    }

    if !outcome.rules.is_empty() {
        println!("--- Installed rules ---");
        for rule in &outcome.rules {
            println!("* {rule}");
        }
    }

    if !outcome.reports.is_empty() {
        println!("--- Tests ---");
        for report in &outcome.reports {
            let verdict = if report.passed { "passed" } else { "FAILED" };
            println!(
                "* {}: {verdict} after {} attempts",
                report.name,
                report.attempts()
            );
            if let Some(error) = &report.error {
                println!("  * error: {error}");
            }
            for result in &report.results {
                println!("  * {result}");
            }
        }
    }

    if !outcome.connections.is_empty() {
        println!("--- Tracked connections ---");
        for connection in &outcome.connections {
            println!("* {connection}");
        }
    }

    println!("--- Summary ---");
    println!(
        "* {}/{} scenarios passed",
        outcome.passed_scenarios(),
        outcome.reports.len()
    );
    if outcome.interrupted {
        println!("* Interrupted, the lab was torn down early");
    }
    if let Some(e) = &outcome.setup_error {
        println!("* Setup failed: {}", error_chain(e));
    }
    for e in &outcome.teardown_errors {
        println!("* Teardown: {}", error_chain(e));
    }
    println!("* {} commands executed", outcome.command_log.len());
}

fn link_list(links: &[LinkId]) -> String {
    let ids: Vec<_> = links.iter().map(|l| l.to_string()).collect();
    ids.join(", ")
}

/// Joins an error and its sources, outermost first
fn error_chain(error: &dyn Error) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(e) = source {
        chain.push_str(": ");
        chain.push_str(&e.to_string());
        source = e.source();
    }
    chain
}

pub fn save_command_log(outcome: &RunOutcome, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&outcome.command_log)
        .context("failed to serialize the command log")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write command log to `{}`", path.display()))?;
    println!("--- Command log ---");
    println!("* Command log available at {}", path.display());
    Ok(())
}
