/// Tracks how long the daemon has gone without a newly verified file.
#[derive(Debug, Clone, Copy)]
struct IdleClock {
    last_progress: Instant,
    timeout: Option<Duration>,
}

impl IdleClock {
    fn new(now: Instant, timeout: Option<Duration>) -> Self {
        Self {
            last_progress: now,
            timeout,
        }
    }

    fn observe(&mut self, now: Instant, newly_verified: usize) {
        if newly_verified > 0 {
            self.last_progress = now;
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|timeout| now.saturating_duration_since(self.last_progress) >= timeout)
    }

    /// Sleep until the next pass, cut short if the idle timeout lands first.
    fn next_wait(&self, now: Instant, refresh: Duration) -> Duration {
        match self.timeout {
            Some(timeout) => {
                let idle_for = now.saturating_duration_since(self.last_progress);
                refresh.min(timeout.saturating_sub(idle_for))
            }
            None => refresh,
        }
    }
}

fn render_status(counts: &StatusCounts, last: Option<&PassSummary>) -> String {
    let mut out = format!(
        "records: {} (verified {}, pending {}, downloading {}, failed {}, missing {})\n",
        counts.total(),
        counts.verified,
        counts.pending,
        counts.downloading,
        counts.failed,
        counts.missing
    );
    match last {
        Some(pass) => {
            out.push_str(&format!(
                "last pass: {} -> {} phase={}{}\n",
                format_unix(pass.started_at),
                format_unix(pass.finished_at),
                pass.phase,
                if pass.partial { " (partial)" } else { "" }
            ));
            out.push_str(&format!(
                "  fetched {}, skipped {}, failed {}, missing {}, renamed {}\n",
                pass.fetched, pass.skipped, pass.failed, pass.missing, pass.renamed
            ));
            for failure in &pass.failures {
                out.push_str(&format!("  failure: {failure}\n"));
            }
        }
        None => out.push_str("last pass: never\n"),
    }
    out
}

fn format_unix(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}
