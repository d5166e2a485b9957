use anyhow::{Context, Result};
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Instant;
use tokio::io::AsyncWriteExt;

/// Turns completed, labeled by run kind and terminal status.
pub static TURNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();
/// Wall-clock duration of a turn slot, labeled by run kind.
pub static TURN_DURATION: OnceLock<HistogramVec> = OnceLock::new();
/// Comments completed, labeled by outcome (posted/skipped/violation/timeout).
pub static COMMENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();
/// Gateway retry attempts, labeled by model and outcome.
pub static GATEWAY_RETRIES: OnceLock<CounterVec> = OnceLock::new();
/// Gateway model-fallback events, labeled by from/to model.
pub static GATEWAY_FALLBACKS: OnceLock<CounterVec> = OnceLock::new();
/// Fact-check verdicts, labeled by verdict.
pub static FACTCHECK_VERDICTS: OnceLock<CounterVec> = OnceLock::new();
/// Events dropped at the live event bus due to a full subscriber queue.
pub static EVENT_BUS_DROPS: OnceLock<CounterVec> = OnceLock::new();

static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

/// Times a turn or comment slot and records it against `TURN_DURATION` on completion.
pub struct SlotTimer {
    start: Instant,
    run_kind: String,
}

impl SlotTimer {
    pub fn new(run_kind: &str) -> Self {
        Self {
            start: Instant::now(),
            run_kind: run_kind.to_string(),
        }
    }

    pub fn complete(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        if let Some(turns_total) = TURNS_TOTAL.get() {
            turns_total
                .with_label_values(&[&self.run_kind, status])
                .inc();
        }
        if let Some(turn_duration) = TURN_DURATION.get() {
            turn_duration
                .with_label_values(&[&self.run_kind])
                .observe(duration);
        }
    }
}

pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn init_metrics() -> Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("metrics initialization failed: {e}")),
    }
}

fn init_metrics_internal() -> Result<()> {
    if TURNS_TOTAL.get().is_some() {
        return Ok(());
    }

    let turns_total = register_counter_vec!(
        "agon_turns_total",
        "Total turns processed, by run kind and terminal status",
        &["run_kind", "status"]
    )
    .context("failed to register TURNS_TOTAL metric")?;

    let turn_duration = register_histogram_vec!(
        "agon_turn_duration_seconds",
        "Turn slot duration in seconds, by run kind",
        &["run_kind"]
    )
    .context("failed to register TURN_DURATION metric")?;

    let comments_total = register_counter_vec!(
        "agon_comments_total",
        "Total comments processed, by outcome",
        &["outcome"]
    )
    .context("failed to register COMMENTS_TOTAL metric")?;

    let gateway_retries = register_counter_vec!(
        "agon_gateway_retries_total",
        "Gateway retry attempts, by model and outcome",
        &["model", "outcome"]
    )
    .context("failed to register GATEWAY_RETRIES metric")?;

    let gateway_fallbacks = register_counter_vec!(
        "agon_gateway_fallbacks_total",
        "Gateway model-fallback events",
        &["from_model", "to_model"]
    )
    .context("failed to register GATEWAY_FALLBACKS metric")?;

    let factcheck_verdicts = register_counter_vec!(
        "agon_factcheck_verdicts_total",
        "Fact-check verdicts issued",
        &["verdict"]
    )
    .context("failed to register FACTCHECK_VERDICTS metric")?;

    let event_bus_drops = register_counter_vec!(
        "agon_event_bus_drops_total",
        "Events dropped due to a full subscriber queue",
        &["event_name"]
    )
    .context("failed to register EVENT_BUS_DROPS metric")?;

    TURNS_TOTAL
        .set(turns_total)
        .map_err(|_| anyhow::anyhow!("failed to set TURNS_TOTAL"))?;
    TURN_DURATION
        .set(turn_duration)
        .map_err(|_| anyhow::anyhow!("failed to set TURN_DURATION"))?;
    COMMENTS_TOTAL
        .set(comments_total)
        .map_err(|_| anyhow::anyhow!("failed to set COMMENTS_TOTAL"))?;
    GATEWAY_RETRIES
        .set(gateway_retries)
        .map_err(|_| anyhow::anyhow!("failed to set GATEWAY_RETRIES"))?;
    GATEWAY_FALLBACKS
        .set(gateway_fallbacks)
        .map_err(|_| anyhow::anyhow!("failed to set GATEWAY_FALLBACKS"))?;
    FACTCHECK_VERDICTS
        .set(factcheck_verdicts)
        .map_err(|_| anyhow::anyhow!("failed to set FACTCHECK_VERDICTS"))?;
    EVENT_BUS_DROPS
        .set(event_bus_drops)
        .map_err(|_| anyhow::anyhow!("failed to set EVENT_BUS_DROPS"))?;

    Ok(())
}

/// Compatibility wrapper for call sites that don't want to propagate a `Result`.
pub fn init_metrics_legacy() {
    if let Err(e) = init_metrics() {
        tracing::warn!("failed to initialize metrics: {e}");
    }
}

/// Serves `/metrics` as plain Prometheus text over a raw TCP responder — no
/// web framework is justified for one read-only endpoint.
pub async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    init_metrics().context("failed to initialize metrics")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    tracing::info!("metrics server listening on http://0.0.0.0:{port}");

    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                tokio::spawn(async move {
                    let body = get_metrics();
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if let Err(e) = stream.write_all(resp.as_bytes()).await {
                        tracing::error!("metrics write error: {e:?}");
                    }
                    let _ = stream.shutdown().await;
                });
            }
            Err(e) => {
                tracing::error!("failed to accept connection: {e:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        init_metrics().expect("first init should succeed");
        init_metrics().expect("second init should be a no-op, not an error");
        assert!(TURNS_TOTAL.get().is_some());
    }

    #[test]
    fn test_get_metrics_nonempty_after_init() {
        init_metrics().expect("init should succeed");
        if let Some(turns_total) = TURNS_TOTAL.get() {
            turns_total.with_label_values(&["debate", "completed"]).inc();
        }
        let body = get_metrics();
        assert!(body.contains("agon_turns_total"));
    }
}
