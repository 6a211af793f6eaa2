//! End-of-run report
//!
//! Built once from the final metrics snapshot and threshold verdict. Printed
//! as a boxed text summary for humans and serialized as JSON for CI.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::stats::{EndpointSnapshot, LatencySummary, MetricsSnapshot};
use crate::threshold::Verdict;

/// Process exit code when at least one threshold failed
pub const THRESHOLD_FAILURE_EXIT_CODE: u8 = 99;

/// Failed requests split by cause
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureBreakdown {
    pub transport: u64,
    pub timeout: u64,
    pub status: u64,
    pub check: u64,
}

/// Final result of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub seed: u64,
    pub duration_secs: f64,
    pub peak_workers: usize,
    /// Stopped before the last stage ended
    pub interrupted: bool,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub failures: FailureBreakdown,
    /// Requests per second over the whole run
    pub throughput: f64,
    pub latency: LatencySummary,
    pub endpoints: Vec<EndpointSnapshot>,
    pub verdict: Verdict,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        seed: u64,
        peak_workers: usize,
        snapshot: &MetricsSnapshot,
        verdict: Verdict,
    ) -> Self {
        Self {
            run_id,
            started_at,
            seed,
            duration_secs: snapshot.elapsed.as_secs_f64(),
            peak_workers,
            interrupted: false,
            total_requests: snapshot.count,
            failed_requests: snapshot.errors,
            error_rate: snapshot.error_rate(),
            failures: FailureBreakdown {
                transport: snapshot.transport_errors,
                timeout: snapshot.timeouts,
                status: snapshot.status_errors,
                check: snapshot.check_failures,
            },
            throughput: snapshot.throughput(),
            latency: snapshot.latency_summary(),
            endpoints: snapshot.endpoints.clone(),
            verdict,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict.passed
    }

    /// 0 when every threshold held
    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            0
        } else {
            THRESHOLD_FAILURE_EXIT_CODE
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Render the human-readable summary
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let rule = "═══════════════════════════════════════════════════════════════";
        let ms = |v: Option<f64>| {
            v.map(|v| format!("{:.2}ms", v))
                .unwrap_or_else(|| "n/a".to_string())
        };

        out.push_str(&format!("\n{}\n", rule));
        out.push_str(&format!(" LOAD TEST SUMMARY  run {}\n", self.run_id));
        out.push_str(&format!("{}\n\n", rule));

        out.push_str(&format!(
            "   Duration:        {:.1}s (peak {} workers, seed {})\n",
            self.duration_secs, self.peak_workers, self.seed
        ));
        if self.interrupted {
            out.push_str("   Interrupted before the last stage ended\n");
        }
        out.push_str(&format!("   Total Requests:  {}\n", self.total_requests));
        out.push_str(&format!(
            "   Error Rate:      {:.2}% ({} failed)\n",
            self.error_rate * 100.0,
            self.failed_requests
        ));
        if self.failed_requests > 0 {
            out.push_str(&format!(
                "                    transport={} timeout={} status={} check={}\n",
                self.failures.transport,
                self.failures.timeout,
                self.failures.status,
                self.failures.check
            ));
        }
        out.push_str(&format!("   Response (avg):  {}\n", ms(self.latency.avg_ms)));
        out.push_str(&format!("   Response (p95):  {}\n", ms(self.latency.p95_ms)));
        out.push_str(&format!("   Response (p99):  {}\n", ms(self.latency.p99_ms)));
        out.push_str(&format!("   Throughput:      {:.2} req/s\n", self.throughput));

        if !self.endpoints.is_empty() {
            out.push_str("\n ─── Endpoints ───────────────────────────────────────────────\n\n");
            out.push_str(&format!(
                "   {:24} {:>10} {:>10}\n",
                "Name", "Requests", "Errors"
            ));
            for endpoint in &self.endpoints {
                out.push_str(&format!(
                    "   {:24} {:>10} {:>10}\n",
                    endpoint.name, endpoint.count, endpoint.errors
                ));
            }
        }

        if !self.verdict.results.is_empty() {
            out.push_str("\n ─── Thresholds ──────────────────────────────────────────────\n\n");
            for result in &self.verdict.results {
                let observed = result
                    .observed
                    .map(|v| format!("{:.4}", v))
                    .unwrap_or_else(|| "no data".to_string());
                let mark = if result.passed { "✓" } else { "✗" };
                out.push_str(&format!(
                    "   {} {:20} observed {}\n",
                    mark,
                    result.rule.to_string(),
                    observed
                ));
            }
        }

        out.push_str(&format!("\n{}\n", rule));
        let overall = if self.passed() {
            "PASS"
        } else {
            "FAIL (threshold exceeded)"
        };
        out.push_str(&format!(" OVERALL: {}\n", overall));
        out.push_str(&format!("{}\n", rule));
        out
    }
}
