use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use salvo::prelude::*;

type LabeledCounter = Mutex<HashMap<String, u64>>;

#[derive(Default)]
pub struct BridgeMetrics {
    qq_events: LabeledCounter,
    matrix_events: LabeledCounter,
    bridged_messages: LabeledCounter,
    duplicates_dropped_total: AtomicU64,
    outbound_calls: LabeledCounter,
    outbound_failures: LabeledCounter,
    media_failures: LabeledCounter,
    resync_fetches: LabeledCounter,
    worker_panics_total: AtomicU64,
    portal_queue_depth: AtomicU64,
    portal_queue_depth_max: AtomicU64,
    processing_stats: Mutex<HashMap<String, ProcessingStats>>,
}

#[derive(Default, Clone, Copy)]
struct ProcessingStats {
    count: u64,
    sum_ms: u64,
}

static GLOBAL_METRICS: OnceLock<BridgeMetrics> = OnceLock::new();

pub fn global_metrics() -> &'static BridgeMetrics {
    GLOBAL_METRICS.get_or_init(BridgeMetrics::default)
}

impl BridgeMetrics {
    pub fn record_qq_event(&self, kind: &str) {
        increment(&self.qq_events, kind);
    }

    pub fn record_matrix_event(&self, event_type: &str) {
        increment(&self.matrix_events, event_type);
    }

    /// `direction` is `qq_to_matrix` or `matrix_to_qq`.
    pub fn record_bridged(&self, direction: &str) {
        increment(&self.bridged_messages, direction);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound_call(&self, api: &str) {
        increment(&self.outbound_calls, api);
    }

    pub fn record_outbound_failure(&self, api: &str, code: &str) {
        increment(&self.outbound_failures, &format!("{}|{}", api, code));
    }

    pub fn record_media_failure(&self, kind: &str) {
        increment(&self.media_failures, kind);
    }

    pub fn record_resync_fetch(&self, target: &str) {
        increment(&self.resync_fetches, target);
    }

    pub fn record_worker_panic(&self) {
        self.worker_panics_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_duration(&self, stage: &str, duration: Duration) {
        let mut guard = self.processing_stats.lock();
        let entry = guard.entry(stage.to_string()).or_default();
        entry.count = entry.count.saturating_add(1);
        entry.sum_ms = entry
            .sum_ms
            .saturating_add(duration.as_millis().min(u64::MAX as u128) as u64);
    }

    /// Counts one item waiting in or running on a portal queue until the
    /// guard drops.
    pub fn begin_queue_task(&self) -> QueueDepthGuard {
        let current = self.portal_queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.portal_queue_depth_max
            .fetch_max(current, Ordering::Relaxed);
        QueueDepthGuard { _private: () }
    }

    fn end_queue_task(&self) {
        let _ = self
            .portal_queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            });
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped_total.load(Ordering::Relaxed)
    }

    pub fn worker_panics(&self) -> u64 {
        self.worker_panics_total.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let mut body = String::new();

        render_labeled(
            &mut body,
            "qq_bridge_qq_events_total",
            "Events received from the QQ relay",
            "kind",
            &self.qq_events,
        );
        render_labeled(
            &mut body,
            "qq_bridge_matrix_events_total",
            "Events received from the homeserver",
            "event_type",
            &self.matrix_events,
        );
        render_labeled(
            &mut body,
            "qq_bridge_messages_bridged_total",
            "Messages delivered to the other side",
            "direction",
            &self.bridged_messages,
        );

        body.push_str("# HELP qq_bridge_duplicates_dropped_total Redelivered QQ messages dropped\n");
        body.push_str("# TYPE qq_bridge_duplicates_dropped_total counter\n");
        body.push_str(&format!(
            "qq_bridge_duplicates_dropped_total {}\n",
            self.duplicates_dropped()
        ));

        render_labeled(
            &mut body,
            "qq_bridge_outbound_calls_total",
            "Outbound API calls",
            "api",
            &self.outbound_calls,
        );

        body.push_str("# HELP qq_bridge_outbound_failures_total Outbound API failures\n");
        body.push_str("# TYPE qq_bridge_outbound_failures_total counter\n");
        for (api_code, count) in sorted_pairs(&self.outbound_failures) {
            let (api, code) = api_code.split_once('|').unwrap_or((&api_code, "unknown"));
            body.push_str(&format!(
                "qq_bridge_outbound_failures_total{{api=\"{}\",code=\"{}\"}} {}\n",
                escape_label(api),
                escape_label(code),
                count
            ));
        }

        render_labeled(
            &mut body,
            "qq_bridge_media_failures_total",
            "Attachments that could not be bridged",
            "kind",
            &self.media_failures,
        );
        render_labeled(
            &mut body,
            "qq_bridge_resync_fetches_total",
            "Remote metadata fetches made by the resync sweep",
            "target",
            &self.resync_fetches,
        );

        body.push_str("# HELP qq_bridge_worker_panics_total Portal queue items that panicked\n");
        body.push_str("# TYPE qq_bridge_worker_panics_total counter\n");
        body.push_str(&format!(
            "qq_bridge_worker_panics_total {}\n",
            self.worker_panics()
        ));

        body.push_str("# HELP qq_bridge_portal_queue_depth Items queued across portals\n");
        body.push_str("# TYPE qq_bridge_portal_queue_depth gauge\n");
        body.push_str(&format!(
            "qq_bridge_portal_queue_depth {}\n",
            self.portal_queue_depth.load(Ordering::Relaxed)
        ));
        body.push_str(&format!(
            "qq_bridge_portal_queue_depth_max {}\n",
            self.portal_queue_depth_max.load(Ordering::Relaxed)
        ));

        body.push_str("# HELP qq_bridge_processing_duration_ms_sum Processing time by stage\n");
        body.push_str("# TYPE qq_bridge_processing_duration_ms_sum counter\n");
        let mut stages: Vec<(String, ProcessingStats)> = self
            .processing_stats
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        stages.sort_by(|a, b| a.0.cmp(&b.0));
        for (stage, stats) in stages {
            body.push_str(&format!(
                "qq_bridge_processing_duration_ms_sum{{stage=\"{}\"}} {}\n",
                escape_label(&stage),
                stats.sum_ms
            ));
            body.push_str(&format!(
                "qq_bridge_processing_duration_ms_count{{stage=\"{}\"}} {}\n",
                escape_label(&stage),
                stats.count
            ));
        }

        body
    }
}

pub struct QueueDepthGuard {
    _private: (),
}

impl Drop for QueueDepthGuard {
    fn drop(&mut self) {
        global_metrics().end_queue_task();
    }
}

pub struct ScopedTimer {
    stage: &'static str,
    started_at: Instant,
}

impl ScopedTimer {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            started_at: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        global_metrics().record_processing_duration(self.stage, self.started_at.elapsed());
    }
}

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    res.status_code(StatusCode::OK);
    res.render(global_metrics().render_prometheus());
}

fn render_labeled(body: &mut String, name: &str, help: &str, label: &str, map: &LabeledCounter) {
    body.push_str(&format!("# HELP {} {}\n", name, help));
    body.push_str(&format!("# TYPE {} counter\n", name));
    for (value, count) in sorted_pairs(map) {
        body.push_str(&format!(
            "{}{{{}=\"{}\"}} {}\n",
            name,
            label,
            escape_label(&value),
            count
        ));
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn increment(map: &LabeledCounter, key: &str) {
    let mut guard = map.lock();
    let counter = guard.entry(key.to_string()).or_insert(0);
    *counter = counter.saturating_add(1);
}

fn sorted_pairs(map: &LabeledCounter) -> Vec<(String, u64)> {
    let mut values: Vec<(String, u64)> =
        map.lock().iter().map(|(k, v)| (k.clone(), *v)).collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_counters_render_sorted() {
        let metrics = BridgeMetrics::default();
        metrics.record_qq_event("message");
        metrics.record_qq_event("message");
        metrics.record_qq_event("group_recall");
        metrics.record_outbound_failure("send_group_msg", "1200");
        metrics.record_duplicate();

        let body = metrics.render_prometheus();
        assert!(body.contains("qq_bridge_qq_events_total{kind=\"message\"} 2"));
        let recall = body.find("kind=\"group_recall\"").unwrap();
        let message = body.find("kind=\"message\"").unwrap();
        assert!(recall < message);
        assert!(body.contains("api=\"send_group_msg\",code=\"1200\""));
        assert!(body.contains("qq_bridge_duplicates_dropped_total 1"));
    }
}
