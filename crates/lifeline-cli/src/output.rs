//! Terminal output formatting.

use colored::{ColoredString, Colorize};
use lifeline_core::{
    Document, GraphNode, ServiceStatus, ServiceStatusReport, TransactionResult, UnsyncedStats,
};

fn availability(status: &ServiceStatus) -> ColoredString {
    if status.available {
        "available".green()
    } else {
        "unavailable".red()
    }
}

fn print_service(name: &str, status: &ServiceStatus) {
    let latency = status
        .latency_ms
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {:<16} {:<14} {:>8}  {}",
        name,
        availability(status),
        latency,
        status.last_checked.format("%H:%M:%S").to_string().dimmed()
    );
    if let Some(err) = &status.error {
        println!("  {:<16} {}", "", err.red());
    }
}

/// Print both store statuses.
pub fn print_status(report: &ServiceStatusReport) {
    println!("{}", "Stores".bold());
    print_service("document store", &report.document_store);
    print_service("graph store", &report.graph_store);
}

/// Print the reconciliation queue summary.
pub fn print_stats(stats: &UnsyncedStats) {
    println!("{}", "Unsynced graph operations".bold());
    if stats.total_queued == 0 {
        println!("  {}", "Queue empty.".dimmed());
    } else {
        println!("  queued: {}", stats.total_queued.to_string().yellow());
        for (kind, count) in &stats.counts_by_kind {
            println!("    {:<10} {}", kind.to_string(), count);
        }
        for (collection, count) in &stats.counts_by_collection {
            println!("    {:<10} {}", collection.cyan(), count);
        }
        if let (Some(oldest), Some(newest)) = (stats.oldest_enqueued_at, stats.newest_enqueued_at) {
            println!("  oldest: {}  newest: {}", oldest.to_rfc3339(), newest.to_rfc3339());
        }
    }
    if stats.evicted_total > 0 || stats.permanently_failed_total > 0 {
        println!(
            "  {} evicted, {} permanently failed",
            stats.evicted_total.to_string().red(),
            stats.permanently_failed_total.to_string().red()
        );
    }
}

/// Print the outcome of a coordinated write.
pub fn print_result(result: &TransactionResult) {
    if result.success {
        let mark = if result.is_degraded() {
            "✓ committed (graph deferred)".yellow()
        } else {
            "✓ committed".green()
        };
        match &result.entity_id {
            Some(id) => println!("{} {}", mark, id.cyan()),
            None => println!("{}", mark),
        }
        if result.attempts > 1 {
            println!("  after {} attempts", result.attempts);
        }
        if result.is_degraded() {
            println!(
                "  {} graph operation(s) queued for replay",
                result.deferred_graph_operations
            );
        }
    } else {
        println!("{}", "✗ failed".red().bold());
        if let Some(err) = &result.error {
            println!("  {}", err);
        }
        println!(
            "  attempts: {}, rolled back: {}",
            result.attempts,
            if result.rollback_performed { "yes" } else { "no" }
        );
    }
}

/// Print an entity as stored on each side.
pub fn print_entity(id: &str, document: Option<&Document>, node: Option<&GraphNode>) {
    println!("{} {}", "Entity".bold(), id.cyan());
    println!();

    println!("{}", "Document".bold());
    match document {
        Some(doc) => print_fields(doc),
        None => println!("  {}", "not found".dimmed()),
    }

    println!();
    println!("{}", "Graph node".bold());
    match node {
        Some(node) => {
            println!("  labels: {}", node.labels.join(", ").magenta());
            print_fields(&node.properties);
        }
        None => println!("  {}", "not found".dimmed()),
    }
}

fn print_fields(fields: &Document) {
    for (key, value) in fields {
        println!("  {:<20} {}", key.dimmed(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_availability_label() {
        colored::control::set_override(false);
        let mut status = ServiceStatus::unknown(Utc::now());
        assert_eq!(availability(&status).to_string(), "unavailable");
        status.available = true;
        assert_eq!(availability(&status).to_string(), "available");
    }
}
