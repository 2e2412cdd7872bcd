use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, TextEncoder};
use tracing::{debug, error, info};

use crate::proxy_service::ProxyService;
use crate::store::ObjectStore;
use crate::telemetry;

const METRICS_FILE_NAME: &str = "proxxy.prom";

/// Periodically write the Prometheus registry to `<textfile_dir>/proxxy.prom`
/// for node_exporter's textfile collector.
///
/// Writes every 10 seconds via write-to-temp and rename. A failed write is
/// logged and retried on the next tick.
pub async fn start_metrics_writer<S: ObjectStore>(
    textfile_dir: String,
    proxy: Arc<ProxyService<S>>,
) -> crate::Result<()> {
    let final_path = Path::new(&textfile_dir).join(METRICS_FILE_NAME);
    let tmp_path = final_path.with_extension("prom.tmp");

    info!(
        "Prometheus metrics writer started, writing to {}",
        final_path.display()
    );

    let mut interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        interval.tick().await;

        telemetry::record_in_flight(proxy.in_flight_uploads());

        let buffer = match encode_metrics() {
            Ok(buffer) => buffer,
            Err(e) => {
                error!("Failed to encode Prometheus metrics: {e}");
                continue;
            }
        };

        match write_metrics_atomic(&tmp_path, &final_path, &buffer) {
            Ok(()) => {
                debug!(
                    "Successfully wrote {} bytes to {}",
                    buffer.len(),
                    final_path.display()
                );
            }
            Err(e) => {
                error!("Failed to write metrics file: {e}");
            }
        }
    }
}

fn encode_metrics() -> prometheus::Result<Vec<u8>> {
    let metric_families = telemetry::PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

/// node_exporter must never read a partially written file.
fn write_metrics_atomic(tmp_path: &Path, final_path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    std::fs::rename(tmp_path, final_path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_replace_previous_file() {
        let dir = std::env::temp_dir().join(format!("proxxy-metrics-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let final_path = dir.join(METRICS_FILE_NAME);
        let tmp_path = final_path.with_extension("prom.tmp");

        write_metrics_atomic(&tmp_path, &final_path, b"first\n").unwrap();
        write_metrics_atomic(&tmp_path, &final_path, b"second\n").unwrap();

        assert_eq!(std::fs::read_to_string(&final_path).unwrap(), "second\n");
        assert!(!tmp_path.exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn registry_uses_crate_prefix() {
        telemetry::record_cache_hit();
        telemetry::record_request_rejected("method");

        let text = String::from_utf8(encode_metrics().unwrap()).unwrap();
        assert!(text.contains("proxxy_cache_hit_total"), "{text}");
        assert!(
            text.contains("proxxy_request_rejected_total{reason=\"method\"}"),
            "{text}"
        );
    }

    #[test]
    fn in_flight_gauge_reports_last_refresh() {
        // Nothing on the request path writes the gauge; the writer loop owns it.
        telemetry::record_in_flight(3);

        let text = String::from_utf8(encode_metrics().unwrap()).unwrap();
        assert!(text.contains("proxxy_single_flight_in_flight 3"), "{text}");
    }
}
