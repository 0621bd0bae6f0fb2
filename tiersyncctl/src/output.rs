//! Text and JSON rendering for command results.

use serde::Serialize;
use tiersync_core::{
    sync::{DrainReport, ManifestStats, QualityReport, QueueStats, ScheduleStatus, TierSummary},
    types::SyncRun,
};

#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            print!("{}", text());
        }
        Ok(())
    }

    pub fn status(&self, status: &ScheduleStatus) -> anyhow::Result<()> {
        self.emit(status, || {
            let mut text = String::new();
            match &status.running {
                Some(run) => text.push_str(&format!(
                    "running: tier {} ({}) since {}\n",
                    run.tier,
                    run.tier_name,
                    run.started_at.format("%Y-%m-%d %H:%M:%S")
                )),
                None => text.push_str("running: none\n"),
            }
            for tier in &status.tiers {
                let last = tier.last_run.as_ref().map_or_else(
                    || "never".to_string(),
                    |run| {
                        format!(
                            "{} ({})",
                            run.started_at.format("%Y-%m-%d %H:%M"),
                            run.status
                        )
                    },
                );
                text.push_str(&format!(
                    "tier {} {:<16} every {:>3}h  last {:<28} {}\n",
                    tier.tier,
                    tier.name,
                    tier.frequency_hours,
                    last,
                    if tier.due {
                        "due now".to_string()
                    } else {
                        format!("next {}", tier.next_run_at.format("%Y-%m-%d %H:%M"))
                    }
                ));
            }
            text
        })
    }

    pub fn runs(&self, runs: &[SyncRun]) -> anyhow::Result<()> {
        self.emit(&runs, || {
            let mut text = String::new();
            for run in runs {
                let c = &run.counters;
                text.push_str(&format!(
                    "{} tier {} {:<10} pages {}/{} failed, new {}, changed {}, removed {}, relisted {}, queued {} ({} suppressed), scraped {}, errors {}\n",
                    run.started_at.format("%Y-%m-%d %H:%M"),
                    run.tier,
                    run.status.to_string(),
                    c.pages_scanned,
                    c.pages_failed,
                    c.new_count,
                    c.changed_count,
                    c.removed_count,
                    c.relisted_count,
                    c.queued_count,
                    c.suppressed_count,
                    c.scraped_count,
                    c.error_count,
                ));
                if let Some(error) = &run.error_summary {
                    text.push_str(&format!("    error: {error}\n"));
                }
                for alert in &run.alerts {
                    text.push_str(&format!("    alert: {alert}\n"));
                }
            }
            if runs.is_empty() {
                text.push_str("no runs\n");
            }
            text
        })
    }

    pub fn summary(&self, summaries: &[TierSummary]) -> anyhow::Result<()> {
        self.emit(&summaries, || {
            let mut text = String::new();
            for summary in summaries {
                let statuses = summary
                    .by_status
                    .iter()
                    .map(|(status, count)| format!("{status}={count}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                text.push_str(&format!(
                    "{:<16} runs {:>3} [{}] new {}, changed {}, removed {}, scraped {}, errors {}\n",
                    summary.name,
                    summary.runs,
                    statuses,
                    summary.counters.new_count,
                    summary.counters.changed_count,
                    summary.counters.removed_count,
                    summary.counters.scraped_count,
                    summary.counters.error_count,
                ));
            }
            if summaries.is_empty() {
                text.push_str("no runs in window\n");
            }
            text
        })
    }

    pub fn queue_stats(&self, stats: &QueueStats) -> anyhow::Result<()> {
        self.emit(stats, || {
            let mut text = format!("total {}\n", stats.total());
            for (status, count) in &stats.by_status {
                text.push_str(&format!("  {status:<12} {count}\n"));
            }
            text.push_str("pending by priority\n");
            for (priority, count) in &stats.pending_by_priority {
                text.push_str(&format!("  P{priority:<11} {count}\n"));
            }
            text.push_str("pending by reason\n");
            for (reason, count) in &stats.pending_by_reason {
                text.push_str(&format!("  {reason:<12} {count}\n"));
            }
            if let Some(oldest) = stats.oldest_pending_at {
                text.push_str(&format!(
                    "oldest pending {}\n",
                    oldest.format("%Y-%m-%d %H:%M:%S")
                ));
            }
            text
        })
    }

    pub fn manifest_stats(&self, stats: &ManifestStats) -> anyhow::Result<()> {
        self.emit(stats, || {
            let mut text = format!(
                "tracked {}\nflagged new {}\nneeds full scrape {}\nprice changed {}\n",
                stats.total, stats.flagged_new, stats.needs_full_scrape, stats.price_changed
            );
            if let Some(hours) = stats.average_staleness_hours {
                text.push_str(&format!("average staleness {hours:.1}h\n"));
            }
            if let Some(oldest) = stats.oldest_last_seen_at {
                text.push_str(&format!(
                    "oldest last seen {}\n",
                    oldest.format("%Y-%m-%d %H:%M:%S")
                ));
            }
            text
        })
    }

    pub fn quality(&self, report: &QualityReport) -> anyhow::Result<()> {
        self.emit(report, || {
            let mut text = format!("{}\n", report.summary_line());
            for (status, count) in &report.by_status {
                text.push_str(&format!("  {status:<12} {count}\n"));
            }
            text
        })
    }

    pub fn drain(&self, report: &DrainReport) -> anyhow::Result<()> {
        self.emit(report, || {
            format!(
                "reclaimed {}, claimed {}, scraped {}, failed {}, lost claims {}, stopped: {:?}\n",
                report.reclaimed,
                report.claimed,
                report.scraped,
                report.failed,
                report.lost_claims,
                report.stopped
            )
        })
    }

    pub fn count(&self, label: &str, count: u64) -> anyhow::Result<()> {
        self.emit(&serde_json::json!({ label: count }), || {
            format!("{label}: {count}\n")
        })
    }

    pub fn message(&self, key: &str, message: String) -> anyhow::Result<()> {
        self.emit(&serde_json::json!({ key: message }), || format!("{message}\n"))
    }
}
