// =============================================================================
// Log Emitter — partitioned, append-only JSONL per stream
// =============================================================================
//
// Path: `{base_dir}/{stream}/date=YYYY-MM-DD/asset={ASSET}/{stream}.jsonl[.gz]`
// with `date` computed in the engine's configured local time zone (default
// IST). One bounded `tokio::sync::mpsc` queue per stream feeds a dedicated
// background writer task that drains up to `batch_size` records or until
// `flush_interval` elapses, rotates the active file once it reaches
// `max_file_size_mb`, and prunes to the most recent `max_files` rotations.
// Sync mode writes inline with retry/backoff, demoting to the `errors`
// stream after `retry_attempts` failures.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::EmitterConfig;
use crate::data_model::LogRecord;

/// The full partitioned stream list. `hyperliquid` carries the
/// cohort-derived flow snapshot (raw fill transport is an external
/// collaborator, but the accumulator's output is core).
pub const STREAMS: [&str; 17] = [
    "market_ingest_log",
    "signals",
    "ensemble_log",
    "calibration_log",
    "order_intent",
    "execution",
    "costs_log",
    "pnl_equity_log",
    "sizing_risk_log",
    "health",
    "feature_log",
    "overlay_status",
    "kpi_scorecard",
    "bandit",
    "alerts",
    "repro",
    "hyperliquid",
];

fn partition_path(base_dir: &str, stream: &str, date: &str, asset: &str, compression: bool) -> PathBuf {
    let ext = if compression { "jsonl.gz" } else { "jsonl" };
    Path::new(base_dir)
        .join(stream)
        .join(format!("date={date}"))
        .join(format!("asset={asset}"))
        .join(format!("{stream}.{ext}"))
}

fn date_str(now_ms: i64, tz: &Tz) -> String {
    let dt = Utc.timestamp_millis_opt(now_ms).single().unwrap_or_else(Utc::now);
    dt.with_timezone(tz).format("%Y-%m-%d").to_string()
}

fn write_records(path: &Path, records: &[LogRecord], compression: bool) -> std::io::Result<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    if compression {
        let mut encoder = GzEncoder::new(file, Compression::default());
        for record in records {
            let line = serde_json::to_string(record).unwrap_or_default();
            encoder.write_all(line.as_bytes())?;
            encoder.write_all(b"\n")?;
        }
        encoder.finish()?;
    } else {
        let mut file = file;
        for record in records {
            let line = serde_json::to_string(record).unwrap_or_default();
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
    }
    Ok(std::fs::metadata(path).map(|m| m.len()).unwrap_or(0))
}

fn rotate_if_needed(path: &Path, max_file_size_mb: u64, max_files: u32) {
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    let max_bytes = max_file_size_mb * 1024 * 1024;
    if meta.len() < max_bytes {
        return;
    }

    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("stream");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("jsonl");
    let rotated = path.with_file_name(format!("{stem}_{stamp}.{ext}"));
    if std::fs::rename(path, &rotated).is_err() {
        return;
    }

    let Some(dir) = path.parent() else { return };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&format!("{stem}_")))
                .unwrap_or(false)
        })
        .filter_map(|e| e.metadata().ok().and_then(|m| m.modified().ok()).map(|t| (t, e.path())))
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, old) in files.into_iter().skip(max_files as usize) {
        let _ = std::fs::remove_file(old);
    }
}

/// Per-record caps: at most 32 fields, at most 1500 bytes once serialized.
/// Over either limit, best-effort trim the bulkiest
/// optional payload keys first (the envelope fields `run_id`/`ts_ist`/
/// `schema_v`/`bar_id`/`asset` are never touched).
const MAX_RECORD_FIELDS: usize = 32;
const MAX_RECORD_BYTES: usize = 1500;

fn enforce_record_caps(mut record: LogRecord) -> LogRecord {
    while record.payload.len() > MAX_RECORD_FIELDS {
        match record.payload.keys().next_back().cloned() {
            Some(key) => {
                record.payload.remove(&key);
            }
            None => break,
        }
    }

    loop {
        let size = serde_json::to_string(&record).map(|s| s.len()).unwrap_or(0);
        if size <= MAX_RECORD_BYTES || record.payload.is_empty() {
            break;
        }
        let bulkiest = record
            .payload
            .iter()
            .max_by_key(|(_, v)| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .map(|(k, _)| k.clone());
        match bulkiest {
            Some(key) => {
                record.payload.remove(&key);
            }
            None => break,
        }
    }

    record
}

fn write_error_record(base_dir: &str, stream: &str, record: &LogRecord, error: &str) {
    let dir = Path::new(base_dir).join("errors");
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let path = dir.join(format!("{stream}_errors.jsonl"));
    let envelope = serde_json::json!({
        "stream": stream,
        "error": error,
        "original_record": record,
    });
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{}", envelope);
    }
}

/// Write one record inline, retrying with exponential backoff, demoting to
/// the `errors` stream after `retry_attempts` failures.
fn write_single_with_retry(cfg: &EmitterConfig, stream: &str, date: &str, asset: &str, record: &LogRecord) {
    let path = partition_path(&cfg.base_dir, stream, date, asset, cfg.compression);
    let mut last_err = String::new();
    for attempt in 0..cfg.retry_attempts {
        rotate_if_needed(&path, cfg.max_file_size_mb, cfg.max_files);
        match write_records(&path, std::slice::from_ref(record), cfg.compression) {
            Ok(_) => return,
            Err(e) => {
                last_err = e.to_string();
                warn!(stream, attempt, error = %last_err, "emitter write attempt failed");
                std::thread::sleep(std::time::Duration::from_secs_f64(
                    cfg.retry_delay_s * 2f64.powi(attempt as i32),
                ));
            }
        }
    }
    error!(stream, error = %last_err, "emitter exhausted retries, demoting to errors stream");
    write_error_record(&cfg.base_dir, stream, record, &last_err);
}

struct StreamHandle {
    tx: mpsc::Sender<LogRecord>,
}

/// Owns one bounded queue + background writer task per stream. Dropping the
/// `LogEmitter` drops every sender, which lets each writer task drain its
/// queue and exit.
pub struct LogEmitter {
    config: EmitterConfig,
    tz: Tz,
    handles: HashMap<&'static str, StreamHandle>,
    sample_counts: HashMap<&'static str, (u64, u64)>,
}

impl LogEmitter {
    pub fn new(config: EmitterConfig, tz: Tz) -> Self {
        let mut handles = HashMap::new();
        if config.enable_async {
            for stream in STREAMS {
                let (tx, rx) = mpsc::channel::<LogRecord>(10_000);
                spawn_writer(stream, rx, config.clone(), tz);
                handles.insert(stream, StreamHandle { tx });
            }
        }
        Self {
            config,
            tz,
            handles,
            sample_counts: HashMap::new(),
        }
    }

    fn should_sample(&mut self, stream: &'static str, rng: &mut impl Rng) -> bool {
        let entry = self.sample_counts.entry(stream).or_insert((0, 0));
        entry.0 += 1;
        if self.config.sampling_rate >= 1.0 {
            entry.1 += 1;
            return true;
        }
        let keep = rng.gen::<f64>() < self.config.sampling_rate;
        if keep {
            entry.1 += 1;
        }
        keep
    }

    /// Enqueue (async mode) or synchronously write (sync mode) one record.
    /// Sampled-out records are counted but not written.
    pub fn emit(&mut self, stream: &'static str, now_ms: i64, mut record: LogRecord, rng: &mut impl Rng) {
        if !self.should_sample(stream, rng) {
            return;
        }
        if record.ts_ist.is_empty() {
            record.ts_ist = Utc
                .timestamp_millis_opt(now_ms)
                .single()
                .unwrap_or_else(Utc::now)
                .with_timezone(&self.tz)
                .to_rfc3339();
        }
        let record = enforce_record_caps(record);

        if let Some(handle) = self.handles.get(stream) {
            match handle.tx.try_send(record) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(record)) => {
                    warn!(stream, "emitter queue full, dropping record under backpressure");
                    let _ = record;
                }
                Err(mpsc::error::TrySendError::Closed(record)) => {
                    let date = date_str(now_ms, &self.tz);
                    write_single_with_retry(&self.config, stream, &date, &record.asset, &record);
                }
            }
        } else {
            let date = date_str(now_ms, &self.tz);
            write_single_with_retry(&self.config, stream, &date, &record.asset, &record);
        }
    }

    pub fn sample_counts(&self) -> HashMap<&'static str, (u64, u64)> {
        self.sample_counts.clone()
    }
}

fn spawn_writer(stream: &'static str, mut rx: mpsc::Receiver<LogRecord>, config: EmitterConfig, tz: Tz) {
    tokio::spawn(async move {
        let mut buf: Vec<LogRecord> = Vec::with_capacity(config.batch_size);
        loop {
            buf.clear();
            let flush_at = tokio::time::Instant::now() + std::time::Duration::from_secs_f64(config.flush_interval_s);
            let closed = loop {
                if buf.len() >= config.batch_size {
                    break false;
                }
                tokio::select! {
                    record = rx.recv() => {
                        match record {
                            Some(r) => buf.push(r),
                            None => break true,
                        }
                    }
                    _ = tokio::time::sleep_until(flush_at) => break false,
                }
            };

            if !buf.is_empty() {
                flush_batch(stream, &buf, &config, &tz);
            }

            if closed {
                info!(stream, "emitter writer task draining complete, exiting");
                break;
            }
        }
    });
}

fn flush_batch(stream: &str, records: &[LogRecord], config: &EmitterConfig, tz: &Tz) {
    let mut by_date_asset: HashMap<(String, String), Vec<&LogRecord>> = HashMap::new();
    for record in records {
        let date = if record.ts_ist.is_empty() {
            Utc::now().with_timezone(tz).format("%Y-%m-%d").to_string()
        } else {
            record.ts_ist.chars().take(10).collect()
        };
        by_date_asset
            .entry((date, record.asset.clone()))
            .or_default()
            .push(record);
    }

    for ((date, asset), group) in by_date_asset {
        let path = partition_path(&config.base_dir, stream, &date, &asset, config.compression);
        rotate_if_needed(&path, config.max_file_size_mb, config.max_files);
        let owned: Vec<LogRecord> = group.into_iter().cloned().collect();
        if let Err(e) = write_records(&path, &owned, config.compression) {
            error!(stream, error = %e, "batch write failed, falling back to per-record retry");
            for record in &owned {
                write_single_with_retry(config, stream, &date, &record.asset, record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(asset: &str) -> LogRecord {
        LogRecord {
            run_id: "run-1".to_string(),
            ts_ist: String::new(),
            schema_v: 1,
            bar_id: 1,
            asset: asset.to_string(),
            payload: serde_json::Map::new(),
        }
    }

    #[test]
    fn partition_path_matches_date_asset_stream_layout() {
        let p = partition_path("root", "signals", "2026-07-29", "BTCUSDT", true);
        assert_eq!(
            p,
            PathBuf::from("root/signals/date=2026-07-29/asset=BTCUSDT/signals.jsonl.gz")
        );
    }

    #[test]
    fn partition_path_uses_plain_extension_without_compression() {
        let p = partition_path("root", "health", "2026-07-29", "ETHUSDT", false);
        assert_eq!(p, PathBuf::from("root/health/date=2026-07-29/asset=ETHUSDT/health.jsonl"));
    }

    #[test]
    fn sampling_rate_of_one_always_keeps() {
        let mut emitter = LogEmitter::new(
            EmitterConfig {
                enable_async: false,
                sampling_rate: 1.0,
                ..EmitterConfig::default()
            },
            "Asia/Kolkata".parse().unwrap(),
        );
        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            assert!(emitter.should_sample("market_ingest_log", &mut rng));
        }
        let counts = emitter.sample_counts();
        assert_eq!(counts["market_ingest_log"], (5, 5));
    }

    #[test]
    fn record_gets_ts_ist_stamped_when_missing() {
        let base_dir = std::env::temp_dir().join(format!("overlay_engine_emitter_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base_dir);
        let cfg = EmitterConfig {
            enable_async: false,
            sampling_rate: 1.0,
            compression: false,
            base_dir: base_dir.to_string_lossy().to_string(),
            ..EmitterConfig::default()
        };
        let mut emitter = LogEmitter::new(cfg.clone(), "Asia/Kolkata".parse().unwrap());
        let mut rng = rand::thread_rng();
        let r = record("BTCUSDT");
        assert!(r.ts_ist.is_empty());

        let now_ms = 1_700_000_000_000;
        emitter.emit("market_ingest_log", now_ms, r, &mut rng);

        let date = date_str(now_ms, &"Asia/Kolkata".parse().unwrap());
        let path = partition_path(&cfg.base_dir, "market_ingest_log", &date, "BTCUSDT", cfg.compression);
        let written = std::fs::read_to_string(&path).expect("emit should have written the record synchronously");
        let parsed: LogRecord = serde_json::from_str(written.lines().next().expect("one record written")).unwrap();
        assert!(!parsed.ts_ist.is_empty());

        let _ = std::fs::remove_dir_all(&base_dir);
    }

    #[test]
    fn enforce_record_caps_trims_field_count_over_limit() {
        let mut r = record("BTCUSDT");
        for i in 0..40 {
            r.payload.insert(format!("k{i:02}"), serde_json::json!(i));
        }
        let capped = enforce_record_caps(r);
        assert!(capped.payload.len() <= MAX_RECORD_FIELDS);
    }

    #[test]
    fn enforce_record_caps_trims_bulkiest_keys_over_byte_limit() {
        let mut r = record("BTCUSDT");
        r.payload.insert("small".to_string(), serde_json::json!(1));
        r.payload
            .insert("bulky".to_string(), serde_json::json!("x".repeat(2000)));
        let capped = enforce_record_caps(r);
        let size = serde_json::to_string(&capped).unwrap().len();
        assert!(size <= MAX_RECORD_BYTES);
        assert!(!capped.payload.contains_key("bulky"));
        assert!(capped.payload.contains_key("small"));
    }

    #[test]
    fn enforce_record_caps_never_touches_envelope_fields() {
        let mut r = record("BTCUSDT");
        r.ts_ist = "2026-07-29T00:00:00+00:00".to_string();
        r.payload
            .insert("huge".to_string(), serde_json::json!("x".repeat(5000)));
        let capped = enforce_record_caps(r);
        assert_eq!(capped.run_id, "run-1");
        assert_eq!(capped.asset, "BTCUSDT");
        assert_eq!(capped.ts_ist, "2026-07-29T00:00:00+00:00");
    }
}
