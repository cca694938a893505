use anyhow::Result;
use chrono::Utc;
use reqwest::blocking::Client;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_core::{TelemetryConfig, UiEvent};

/// Per-session run log plus an optional telemetry sink. The log file lives
/// inside the session storage directory so it travels with the session.
pub struct Observer {
    log_path: PathBuf,
    telemetry: Option<TelemetrySink>,
    verbose: bool,
}

struct TelemetrySink {
    endpoint: String,
    client: Client,
}

impl Observer {
    pub fn new(session_storage_dir: &Path, telemetry_cfg: &TelemetryConfig) -> Result<Self> {
        fs::create_dir_all(session_storage_dir)?;
        Ok(Self {
            log_path: session_storage_dir.join("run.log"),
            telemetry: telemetry_sink(telemetry_cfg)?,
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Record a UI-bound event in the run log and forward it to telemetry.
    pub fn record_ui_event(&self, event: &UiEvent) -> Result<()> {
        self.append_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))?;
        self.emit_telemetry("ui.event", serde_json::to_value(event)?);
        Ok(())
    }

    pub fn info(&self, msg: &str) {
        if self.verbose {
            eprintln!("[tandem] {msg}");
        }
        let _ = self.append_line(&format!("{} INFO {msg}", Utc::now().to_rfc3339()));
    }

    /// Warnings always reach stderr and the log file.
    pub fn warn(&self, msg: &str) {
        eprintln!("[tandem WARN] {msg}");
        let _ = self.append_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn emit_telemetry(&self, name: &str, payload: serde_json::Value) {
        let Some(sink) = &self.telemetry else {
            return;
        };
        let body = json!({
            "name": name,
            "at": Utc::now().to_rfc3339(),
            "payload": payload,
        });
        // Fire-and-forget on a background thread so a slow endpoint never
        // stalls the run loop.
        let client = sink.client.clone();
        let endpoint = sink.endpoint.clone();
        let log_path = self.log_path.clone();
        std::thread::spawn(move || {
            if let Err(err) = client.post(&endpoint).json(&body).send() {
                let line = format!("{} TELEMETRY_ERROR {err}", Utc::now().to_rfc3339());
                let _ = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .and_then(|mut f| writeln!(f, "{line}"));
            }
        });
    }
}

fn telemetry_sink(cfg: &TelemetryConfig) -> Result<Option<TelemetrySink>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let Some(endpoint) = cfg.endpoint.clone() else {
        return Ok(None);
    };
    let client = Client::builder().timeout(Duration::from_secs(3)).build()?;
    Ok(Some(TelemetrySink { endpoint, client }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn events_land_in_the_run_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let observer =
            Observer::new(dir.path(), &TelemetryConfig::default()).expect("observer");
        observer
            .record_ui_event(&UiEvent::Start)
            .expect("record event");
        observer.warn("something odd");

        let log = fs::read_to_string(dir.path().join("run.log")).expect("read log");
        assert!(log.contains("EVENT"));
        assert!(log.contains("WARN something odd"));
    }

    #[test]
    fn telemetry_posts_when_enabled() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = vec![0_u8; 8192];
            let n = stream.read(&mut buf).expect("read request");
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
            request
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let observer = Observer::new(
            dir.path(),
            &TelemetryConfig {
                enabled: true,
                endpoint: Some(format!("http://{addr}/collect")),
            },
        )
        .expect("observer");
        observer.record_ui_event(&UiEvent::Start).expect("record");

        let request = server.join().expect("join server");
        assert!(request.contains("POST /collect"));
        assert!(request.contains("ui.event"));
    }
}
