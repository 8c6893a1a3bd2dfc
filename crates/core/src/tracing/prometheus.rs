//! Prometheus text format export

use std::fmt::Write;

use crate::tracing::metrics::Metrics;

/// Export metrics in Prometheus text format
pub fn export_prometheus(metrics: &Metrics) -> String {
    let mut output = String::new();

    for (name, value) in metrics.all_counters() {
        let _ = writeln!(&mut output, "# TYPE {name} counter\n{name} {value}");
    }

    for (name, value) in metrics.all_gauges() {
        let _ = writeln!(&mut output, "# TYPE {name} gauge\n{name} {value}");
    }

    // Only aggregates are kept, so histograms are exposed as summaries
    for (name, stats) in metrics.all_histograms() {
        let _ = writeln!(&mut output, "# TYPE {name} summary");
        let _ = writeln!(&mut output, "{name}_count {}", stats.count);
        let _ = writeln!(&mut output, "{name}_sum {}", stats.sum);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_format() {
        let metrics = Metrics::new();
        metrics.counter("tlsrelay_sessions_total").add(3);
        metrics.gauge("tlsrelay_sessions_active").set(1);
        metrics.histogram("tlsrelay_session_duration_seconds").observe(0.5);

        let output = export_prometheus(&metrics);
        assert!(output.contains("# TYPE tlsrelay_sessions_total counter\ntlsrelay_sessions_total 3"));
        assert!(output.contains("tlsrelay_sessions_active 1"));
        assert!(output.contains("tlsrelay_session_duration_seconds_count 1"));
        assert!(output.contains("tlsrelay_session_duration_seconds_sum 0.5"));
    }
}
