use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use super::TelemetryEvent;
use crate::controller::SiteHandle;

/// Feed JSON-lines telemetry into the controller until EOF.
///
/// Malformed lines are logged and skipped. Returns the number of events
/// forwarded.
pub async fn forward_json_lines<R>(reader: R, site: &SiteHandle) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0usize;
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<TelemetryEvent>(line) {
            Ok(event) => {
                debug!(entity = %event.entity_id, "telemetry received");
                if site.push(event).await.is_err() {
                    warn!("controller stopped, telemetry input closed");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => warn!(line = line_no, error = %e, "malformed telemetry line skipped"),
        }
    }
    info!(forwarded, "telemetry input finished");
    Ok(forwarded)
}
