//! Command handlers.

use std::sync::Arc;
use std::time::Duration;

use conjure_core::ConjureConfig;
use conjure_storage::{
    gc_task, Diagnostics, GarbageCollector, GcConfig, GcStats, RedisStore, TableStats, TagCount,
    TopReport,
};
use serde::Serialize;
use tokio::sync::watch;

use crate::args::{GcArgs, ScanArgs, TopArgs, TopTarget};
use crate::error::{CliError, CliResult};
use crate::format::{pretty_time_delta, sizeof_fmt, with_commas};

/// Replace the host of a `redis://` URL, keeping credentials, port and
/// database.
pub fn override_host(url: &str, host: &str) -> CliResult<String> {
    let invalid = |reason: &str| CliError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((user, hp)) => (Some(user), hp),
        None => (None, authority),
    };
    let port = match hostport.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => Some(port),
        Some(_) => return Err(invalid("port is not a number")),
        None => None,
    };

    let mut out = format!("{}://", scheme);
    if let Some(user) = userinfo {
        out.push_str(user);
        out.push('@');
    }
    out.push_str(host);
    if let Some(port) = port {
        out.push(':');
        out.push_str(port);
    }
    out.push_str(path);
    Ok(out)
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

// ============================================================================
// GC
// ============================================================================

fn gc_config(args: &GcArgs) -> GcConfig {
    let config = GcConfig::from_env()
        .with_page_size(args.scan.page_size)
        .with_interval(Duration::from_millis(args.interval_ms))
        .with_wait_pages(args.wait_pages)
        .with_max_pages(args.scan.pages);
    match args.every_secs {
        Some(secs) => config.with_check_interval(Duration::from_secs(secs.max(1))),
        None => config,
    }
}

pub async fn gc(
    store: Arc<RedisStore>,
    deployment: &ConjureConfig,
    args: GcArgs,
    json: bool,
) -> CliResult<()> {
    let config = gc_config(&args);
    let deployment = deployment.clone().with_lru(deployment.lru || args.lru);

    if let Some(conj_key) = &args.conj {
        let gc = GarbageCollector::new(store, config, deployment.clustered);
        let stats = gc.sweep_key(conj_key).await;
        return report_gc(&stats, json);
    }

    let gc = Arc::new(GarbageCollector::for_deployment(store, config, &deployment)?);

    match args.every_secs {
        None => {
            let stats = gc.sweep().await;
            report_gc(&stats, json)
        }
        Some(_) => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(gc_task(Arc::clone(&gc), shutdown_rx));
            tokio::signal::ctrl_c().await?;
            let _ = shutdown_tx.send(true);
            match task.await {
                Ok(metrics) => {
                    if json {
                        print_json(&metrics.snapshot())?;
                    }
                    Ok(())
                }
                Err(e) => Err(CliError::Task(e.to_string())),
            }
        }
    }
}

fn report_gc(stats: &GcStats, json: bool) -> CliResult<()> {
    if json {
        print_json(stats)
    } else {
        print!("{}", render_gc(stats));
        Ok(())
    }
}

pub fn render_gc(stats: &GcStats) -> String {
    [
        format!("Processed: {}", with_commas(stats.processed)),
        format!("Deleted Items: {}", with_commas(stats.deleted_items)),
        format!("Deleted Sets: {}", with_commas(stats.deleted_sets)),
        format!("Deleted %: {:.2}", stats.deleted_percent()),
        format!("Bytes per second: {}", sizeof_fmt(stats.bytes_per_sec())),
        format!("Items per second: {:.2}", stats.items_per_sec()),
        format!("Errors: {}", with_commas(stats.errors)),
        format!("Pages: {}", with_commas(stats.pages)),
        format!("Freed: {}", sizeof_fmt(stats.bytes as f64)),
        format!("Time: {}", pretty_time_delta(stats.runtime)),
    ]
    .iter()
    .map(|line| format!("{}\n", line))
    .collect()
}

// ============================================================================
// REPORTS
// ============================================================================

fn diagnostics(
    store: Arc<RedisStore>,
    clustered: bool,
    scan: &ScanArgs,
) -> Diagnostics<RedisStore> {
    Diagnostics::new(store, clustered)
        .with_page_size(scan.page_size)
        .with_max_pages(scan.pages)
}

pub async fn top(
    store: Arc<RedisStore>,
    clustered: bool,
    args: TopArgs,
    json: bool,
) -> CliResult<()> {
    let diag = diagnostics(store, clustered, &args.scan);
    match args.target {
        TopTarget::Sets => {
            let report = diag.largest_sets(args.display).await?;
            if json {
                return print_json(&report);
            }
            print!("{}", render_top(&report, with_commas));
        }
        TopTarget::Keys => {
            let report = diag.largest_keys(args.display).await?;
            if json {
                return print_json(&report);
            }
            print!("{}", render_top(&report, |size| sizeof_fmt(size as f64)));
            println!("Average key size: {}", sizeof_fmt(report.average()));
            println!(
                "{} keys {} sampled",
                with_commas(report.sampled),
                sizeof_fmt(report.total as f64)
            );
        }
        TopTarget::Table { table } => {
            let stats = diag.table_stats(&table).await?;
            if json {
                return print_json(&stats);
            }
            print!("{}", render_table(&stats));
        }
    }
    Ok(())
}

pub fn render_top(report: &TopReport, size: impl Fn(u64) -> String) -> String {
    let mut out = String::new();
    for (i, item) in report.top.iter().enumerate() {
        let rank = format!("{})", i + 1);
        out.push_str(&format!("{:<3} {} {}\n", rank, item.key, size(item.size)));
    }
    out.push_str(&format!(
        "\nkeys={} pages={} in {}\n",
        with_commas(report.sampled),
        with_commas(report.pages),
        pretty_time_delta(report.runtime)
    ));
    out
}

pub fn render_table(stats: &TableStats) -> String {
    format!(
        "conj:{}:*\nsets={} members={} empty={} pages={}\n",
        stats.table,
        with_commas(stats.sets),
        with_commas(stats.members),
        with_commas(stats.empty),
        with_commas(stats.pages)
    )
}

pub async fn tags(
    store: Arc<RedisStore>,
    clustered: bool,
    scan: ScanArgs,
    json: bool,
) -> CliResult<()> {
    let counts = diagnostics(store, clustered, &scan).tag_distribution().await?;
    if json {
        return print_json(&counts);
    }
    for (tag, count) in &counts {
        print!("{}", render_tag(tag, count));
    }
    Ok(())
}

fn render_tag(tag: &str, count: &TagCount) -> String {
    let label = if tag.is_empty() { "(untagged)" } else { tag };
    format!(
        "{:<16} total={} cache={} conj={} schemes={} signal={} other={}\n",
        label,
        with_commas(count.total()),
        with_commas(count.cache),
        with_commas(count.conjunction),
        with_commas(count.schemes),
        with_commas(count.signal),
        with_commas(count.other)
    )
}
