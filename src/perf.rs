use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default)]
struct SpanAgg {
    total_ms: f64,
    count: u64,
}

/// Opt-in JSONL diagnostics: one line per span or counter event, plus an
/// aggregated `<stem>_hot.log` written when the logger is dropped.
#[derive(Clone, Debug)]
pub(crate) struct PerfLogger {
    inner: Arc<Mutex<PerfState>>,
}

#[derive(Debug)]
struct PerfState {
    writer: BufWriter<File>,
    path: PathBuf,
    spans: HashMap<String, SpanAgg>,
    counts: HashMap<String, u64>,
}

impl PerfLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PerfState {
                writer: BufWriter::new(file),
                path,
                spans: HashMap::new(),
                counts: HashMap::new(),
            })),
        })
    }

    pub fn log_span_ms(&self, name: &str, ms: f64) {
        let json = format!(
            "{{\"type\":\"perf.span\",\"name\":\"{}\",\"unit\":\"ms\",\"ms\":{:.3}}}",
            json_escape(name),
            ms
        );
        if let Ok(mut state) = self.inner.lock() {
            let agg = state.spans.entry(name.to_string()).or_default();
            agg.total_ms += ms;
            agg.count = agg.count.saturating_add(1);
            let _ = writeln!(state.writer, "{json}");
        }
    }

    pub fn log_count(&self, name: &str, value: u64) {
        let json = format!(
            "{{\"type\":\"perf.count\",\"name\":\"{}\",\"value\":{}}}",
            json_escape(name),
            value
        );
        if let Ok(mut state) = self.inner.lock() {
            let entry = state.counts.entry(name.to_string()).or_insert(0);
            *entry = entry.saturating_add(value);
            let _ = writeln!(state.writer, "{json}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

impl Drop for PerfState {
    fn drop(&mut self) {
        let hot_path = hot_path_for(&self.path);
        let Ok(file) = File::create(&hot_path) else {
            return;
        };
        let mut writer = BufWriter::new(file);

        let mut spans: Vec<(&String, &SpanAgg)> = self.spans.iter().collect();
        spans.sort_by(|a, b| {
            b.1.total_ms
                .partial_cmp(&a.1.total_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (rank, (name, agg)) in spans.into_iter().enumerate() {
            let avg = if agg.count == 0 {
                0.0
            } else {
                agg.total_ms / agg.count as f64
            };
            let _ = writeln!(
                writer,
                "{{\"type\":\"perf.hot.span\",\"rank\":{},\"name\":\"{}\",\"unit\":\"ms\",\"ms\":{:.3},\"count\":{},\"avg_ms\":{:.3}}}",
                rank + 1,
                json_escape(name),
                agg.total_ms,
                agg.count,
                avg
            );
        }

        let mut counts: Vec<(&String, &u64)> = self.counts.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1));
        for (rank, (name, value)) in counts.into_iter().enumerate() {
            let _ = writeln!(
                writer,
                "{{\"type\":\"perf.hot.count\",\"rank\":{},\"name\":\"{}\",\"value\":{}}}",
                rank + 1,
                json_escape(name),
                value
            );
        }
    }
}

fn hot_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("formstamp_perf.log");
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);
    path.with_file_name(format!("{stem}_hot.log"))
}

pub(crate) fn json_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_escape_handles_quotes_and_newlines() {
        assert_eq!(json_escape("a\"b\nc"), "a\\\"b\\nc");
    }

    #[test]
    fn hot_path_replaces_extension() {
        let path = Path::new("/tmp/compose_perf.log");
        assert_eq!(
            hot_path_for(path),
            PathBuf::from("/tmp/compose_perf_hot.log")
        );
    }

    #[test]
    fn spans_and_counts_land_in_the_log() {
        let dir = std::env::temp_dir().join(format!(
            "formstamp_perf_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let log_path = dir.join("perf.log");
        {
            let logger = PerfLogger::new(&log_path).expect("logger");
            logger.log_span_ms("compose.pdf", 12.5);
            logger.log_count("compose.pages", 2);
            logger.flush();
        }
        let body = std::fs::read_to_string(&log_path).expect("read log");
        assert!(body.contains("\"perf.span\""));
        assert!(body.contains("\"compose.pages\""));
        let hot = std::fs::read_to_string(dir.join("perf_hot.log")).expect("hot log");
        assert!(hot.contains("\"perf.hot.span\""));
    }
}
