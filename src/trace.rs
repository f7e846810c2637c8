//! Optional JSONL trace of stream activity.
//!
//! Enable via `--debug-trace <path>`. Every line is one JSON object with a
//! `t` field (seconds since the gateway started) and an `event` field:
//!
//! ```jsonl
//! {"t":0.004,"event":"stream_start","object":"media/17","from":0,"until":2097151,"parts":2,"client":0}
//! {"t":0.081,"event":"chunk_fetched","object":"media/17","part":1,"offset":0,"bytes":1048576,"latency_ms":76.9}
//! {"t":0.160,"event":"chunk_fetched","object":"media/17","part":2,"offset":1048576,"bytes":1048576,"latency_ms":78.2}
//! {"t":0.162,"event":"stream_done","object":"media/17","sent":2097152,"elapsed_ms":158.3}
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;

pub type SharedTrace = Option<Arc<TraceWriter>>;

pub struct TraceWriter {
    out: Mutex<BufWriter<File>>,
    started: Instant,
}

impl TraceWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            out: Mutex::new(BufWriter::with_capacity(64 * 1024, File::create(path)?)),
            started: Instant::now(),
        })
    }

    pub fn record(&self, mut event: Value) {
        let t = self.started.elapsed().as_secs_f64();
        if let Some(map) = event.as_object_mut() {
            map.insert("t".into(), Value::from(t));
        }
        let mut out = self.out.lock();
        let _ = serde_json::to_writer(&mut *out, &event);
        let _ = writeln!(&mut *out);
    }

    pub fn flush(&self) {
        let _ = self.out.lock().flush();
    }
}

/// Build and record an event only when tracing is on.
#[inline]
pub fn trace_event(trace: &SharedTrace, build: impl FnOnce() -> Value) {
    if let Some(writer) = trace {
        writer.record(build());
    }
}
