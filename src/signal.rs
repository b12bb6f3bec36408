//! Stage events exchanged with the Blender script.
//!
//! Two transports carry the same typed events:
//! - `FileSignals`: marker files `<dir>/<event>.signal`, polled by the receiver
//! - `TcpSignals`: JSON lines over a localhost socket the driver listens on

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::matching::CropRegion;

const SIGNAL_EXTENSION: &str = "signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ScriptReady,
    ExportDone,
    MatchDone,
    SaveDone,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ScriptReady => "script_ready",
            EventKind::ExportDone => "export_done",
            EventKind::MatchDone => "match_done",
            EventKind::SaveDone => "save_done",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.{}", self.as_str(), SIGNAL_EXTENSION)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    /// The script is loaded and about to import the capture.
    ScriptReady,
    /// The capture is imported, merged, recentred and framed in top view.
    ExportDone {
        #[serde(default)]
        vertices: Option<u64>,
    },
    /// Crop region for the script, in window pixels with a top-left origin.
    MatchDone { region: CropRegion },
    SaveDone {
        #[serde(default)]
        project: Option<PathBuf>,
    },
}

impl StageEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StageEvent::ScriptReady => EventKind::ScriptReady,
            StageEvent::ExportDone { .. } => EventKind::ExportDone,
            StageEvent::MatchDone { .. } => EventKind::MatchDone,
            StageEvent::SaveDone { .. } => EventKind::SaveDone,
        }
    }

    /// Decodes a marker body. Events without required fields accept an
    /// empty or non-JSON (timestamp) body.
    pub fn from_marker(kind: EventKind, body: &str) -> Result<Self, SignalError> {
        let body = body.trim();
        if !body.starts_with('{') {
            return match kind {
                EventKind::ScriptReady => Ok(StageEvent::ScriptReady),
                EventKind::ExportDone => Ok(StageEvent::ExportDone { vertices: None }),
                EventKind::SaveDone => Ok(StageEvent::SaveDone { project: None }),
                EventKind::MatchDone => Err(SignalError::Malformed {
                    event: kind,
                    detail: "missing crop region".to_string(),
                }),
            };
        }

        let event: StageEvent = serde_json::from_str(body).map_err(|e| SignalError::Malformed {
            event: kind,
            detail: e.to_string(),
        })?;
        if event.kind() != kind {
            return Err(SignalError::Malformed {
                event: kind,
                detail: format!("marker carries {}", event.kind()),
            });
        }
        Ok(event)
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("timed out after {}s waiting for {event}", .after.as_secs())]
    Timeout { event: EventKind, after: Duration },
    #[error("malformed {event} signal: {detail}")]
    Malformed { event: EventKind, detail: String },
    #[error("signal peer disconnected")]
    Disconnected,
    #[error("no signal peer connected")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the Blender script reaches the driver, written into its params file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportParams {
    File { dir: PathBuf },
    Tcp { host: String, port: u16 },
}

pub trait SignalChannel {
    fn send(&mut self, event: &StageEvent) -> Result<(), SignalError>;

    /// Blocks until `kind` arrives or `timeout` elapses.
    fn wait_for(&mut self, kind: EventKind, timeout: Duration) -> Result<StageEvent, SignalError>;

    /// Drops stale signals from a previous session.
    fn clear(&mut self) -> Result<(), SignalError>;

    fn transport_params(&self) -> TransportParams;
}

pub struct FileSignals {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileSignals {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, SignalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, poll_interval })
    }

    pub fn marker_path(&self, kind: EventKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    fn take_marker(&self, path: &Path, kind: EventKind) -> Result<Option<StageEvent>, SignalError> {
        let body = match fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("Failed to remove signal {}: {}", path.display(), e);
        }
        StageEvent::from_marker(kind, &body).map(Some)
    }
}

impl SignalChannel for FileSignals {
    fn send(&mut self, event: &StageEvent) -> Result<(), SignalError> {
        let body = serde_json::to_string(event).map_err(|e| SignalError::Malformed {
            event: event.kind(),
            detail: e.to_string(),
        })?;
        // Write then rename so the receiver never sees a half-written marker
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.persist(self.marker_path(event.kind()))
            .map_err(|e| SignalError::Io(e.error))?;
        tracing::debug!("Sent {} signal", event.kind());
        Ok(())
    }

    fn wait_for(&mut self, kind: EventKind, timeout: Duration) -> Result<StageEvent, SignalError> {
        let path = self.marker_path(kind);
        let start = Instant::now();
        tracing::info!("Waiting for {} signal (timeout {}s)", kind, timeout.as_secs());

        loop {
            if let Some(event) = self.take_marker(&path, kind)? {
                tracing::info!(
                    "Received {} signal after {:.1}s",
                    kind,
                    start.elapsed().as_secs_f32()
                );
                return Ok(event);
            }
            if start.elapsed() >= timeout {
                return Err(SignalError::Timeout {
                    event: kind,
                    after: timeout,
                });
            }
            std::thread::sleep(self.poll_interval.min(timeout.saturating_sub(start.elapsed())));
        }
    }

    fn clear(&mut self) -> Result<(), SignalError> {
        fs::create_dir_all(&self.dir)?;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == SIGNAL_EXTENSION) {
                tracing::debug!("Removing stale signal {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn transport_params(&self) -> TransportParams {
        TransportParams::File {
            dir: self.dir.clone(),
        }
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    partial: String,
}

/// Localhost transport. The driver listens; the script connects once per session.
pub struct TcpSignals {
    listener: TcpListener,
    conn: Option<Connection>,
    pending: VecDeque<StageEvent>,
}

impl TcpSignals {
    /// Binds `127.0.0.1:port`; port 0 picks a free port.
    pub fn bind(port: u16) -> Result<Self, SignalError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            conn: None,
            pending: VecDeque::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    fn accept_until(&mut self, deadline: Instant, kind: EventKind) -> Result<(), SignalError> {
        while self.conn.is_none() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!("Signal peer connected from {}", peer);
                    stream.set_nonblocking(false)?;
                    let writer = stream.try_clone()?;
                    self.conn = Some(Connection {
                        reader: BufReader::new(stream),
                        writer,
                        partial: String::new(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(SignalError::Timeout {
                            event: kind,
                            after: Duration::ZERO,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_event(&mut self, deadline: Instant, kind: EventKind) -> Result<StageEvent, SignalError> {
        let conn = self.conn.as_mut().ok_or(SignalError::NotConnected)?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SignalError::Timeout {
                    event: kind,
                    after: Duration::ZERO,
                });
            }
            conn.reader.get_ref().set_read_timeout(Some(remaining))?;

            match conn.reader.read_line(&mut conn.partial) {
                Ok(0) => {
                    self.conn = None;
                    return Err(SignalError::Disconnected);
                }
                Ok(_) if conn.partial.ends_with('\n') => {
                    let line = std::mem::take(&mut conn.partial);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return serde_json::from_str(line).map_err(|e| SignalError::Malformed {
                        event: kind,
                        detail: e.to_string(),
                    });
                }
                // EOF mid-line; the next read reports the disconnect
                Ok(_) => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl SignalChannel for TcpSignals {
    fn send(&mut self, event: &StageEvent) -> Result<(), SignalError> {
        let conn = self.conn.as_mut().ok_or(SignalError::NotConnected)?;
        let mut line = serde_json::to_string(event).map_err(|e| SignalError::Malformed {
            event: event.kind(),
            detail: e.to_string(),
        })?;
        line.push('\n');
        conn.writer.write_all(line.as_bytes())?;
        conn.writer.flush()?;
        tracing::debug!("Sent {} event", event.kind());
        Ok(())
    }

    fn wait_for(&mut self, kind: EventKind, timeout: Duration) -> Result<StageEvent, SignalError> {
        tracing::info!("Waiting for {} event (timeout {}s)", kind, timeout.as_secs());
        if let Some(pos) = self.pending.iter().position(|e| e.kind() == kind) {
            if let Some(event) = self.pending.remove(pos) {
                return Ok(event);
            }
        }

        let deadline = Instant::now() + timeout;
        let timed_out = |err: SignalError| match err {
            SignalError::Timeout { event, .. } => SignalError::Timeout {
                event,
                after: timeout,
            },
            other => other,
        };

        self.accept_until(deadline, kind).map_err(timed_out)?;
        loop {
            let event = self.read_event(deadline, kind).map_err(timed_out)?;
            if event.kind() == kind {
                return Ok(event);
            }
            tracing::debug!("Queued {} event while waiting for {}", event.kind(), kind);
            self.pending.push_back(event);
        }
    }

    fn clear(&mut self) -> Result<(), SignalError> {
        self.conn = None;
        self.pending.clear();
        // Drop connections left in the backlog by an earlier session
        while self.listener.accept().is_ok() {}
        Ok(())
    }

    fn transport_params(&self) -> TransportParams {
        TransportParams::Tcp {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port: self.port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn region() -> CropRegion {
        CropRegion {
            x: 10,
            y: 20,
            width: 300,
            height: 200,
        }
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_string(&StageEvent::MatchDone { region: region() }).unwrap();
        assert_eq!(
            json,
            r#"{"event":"match_done","region":{"x":10,"y":20,"width":300,"height":200}}"#
        );
        let parsed: StageEvent = serde_json::from_str(r#"{"event":"save_done"}"#).unwrap();
        assert_eq!(parsed, StageEvent::SaveDone { project: None });
    }

    #[test]
    fn test_marker_bodies() {
        assert_eq!(
            StageEvent::from_marker(EventKind::ScriptReady, "").unwrap(),
            StageEvent::ScriptReady
        );
        assert_eq!(
            StageEvent::from_marker(EventKind::ExportDone, "1715000000.123\n").unwrap(),
            StageEvent::ExportDone { vertices: None }
        );
        assert!(matches!(
            StageEvent::from_marker(EventKind::MatchDone, ""),
            Err(SignalError::Malformed { .. })
        ));
        assert!(matches!(
            StageEvent::from_marker(EventKind::SaveDone, r#"{"event":"script_ready"}"#),
            Err(SignalError::Malformed { .. })
        ));
    }

    #[test]
    fn test_file_signal_is_consumed() {
        let dir = tempdir().unwrap();
        let mut signals = FileSignals::new(dir.path(), Duration::from_millis(20)).unwrap();

        let event = StageEvent::MatchDone { region: region() };
        signals.send(&event).unwrap();
        assert!(signals.marker_path(EventKind::MatchDone).exists());

        let start = Instant::now();
        let received = signals
            .wait_for(EventKind::MatchDone, Duration::from_secs(5))
            .unwrap();
        assert_eq!(received, event);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!signals.marker_path(EventKind::MatchDone).exists());
    }

    #[test]
    fn test_file_signal_timeout() {
        let dir = tempdir().unwrap();
        let mut signals = FileSignals::new(dir.path(), Duration::from_millis(20)).unwrap();

        let start = Instant::now();
        let err = signals
            .wait_for(EventKind::SaveDone, Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(
            err,
            SignalError::Timeout {
                event: EventKind::SaveDone,
                ..
            }
        ));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_file_signal_written_later() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("export_done.signal");
        let mut signals = FileSignals::new(dir.path(), Duration::from_millis(20)).unwrap();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            fs::write(marker, r#"{"event":"export_done","vertices":1200}"#).unwrap();
        });
        let event = signals
            .wait_for(EventKind::ExportDone, Duration::from_secs(5))
            .unwrap();
        writer.join().unwrap();
        assert_eq!(event, StageEvent::ExportDone { vertices: Some(1200) });
    }

    #[test]
    fn test_clear_removes_only_markers() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("save_done.signal"), "").unwrap();
        fs::write(dir.path().join("params.json"), "{}").unwrap();

        let mut signals = FileSignals::new(dir.path(), Duration::from_millis(20)).unwrap();
        signals.clear().unwrap();
        assert!(!dir.path().join("save_done.signal").exists());
        assert!(dir.path().join("params.json").exists());
    }

    #[test]
    fn test_tcp_events_out_of_order() {
        let mut signals = TcpSignals::bind(0).unwrap();
        let port = signals.port();
        assert_ne!(port, 0);

        let script = std::thread::spawn(move || {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
            stream
                .write_all(b"{\"event\":\"export_done\",\"vertices\":42}\n{\"event\":\"script_ready\"}\n")
                .unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            stream.write_all(b"{\"event\":\"save_done\"}\n").unwrap();
            line
        });

        let ready = signals
            .wait_for(EventKind::ScriptReady, Duration::from_secs(5))
            .unwrap();
        assert_eq!(ready, StageEvent::ScriptReady);
        let export = signals
            .wait_for(EventKind::ExportDone, Duration::from_secs(5))
            .unwrap();
        assert_eq!(export, StageEvent::ExportDone { vertices: Some(42) });

        signals
            .send(&StageEvent::MatchDone { region: region() })
            .unwrap();
        let saved = signals
            .wait_for(EventKind::SaveDone, Duration::from_secs(5))
            .unwrap();
        assert_eq!(saved, StageEvent::SaveDone { project: None });

        let line = script.join().unwrap();
        let sent: StageEvent = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(sent, StageEvent::MatchDone { region: region() });
    }

    #[test]
    fn test_tcp_timeout_without_peer() {
        let mut signals = TcpSignals::bind(0).unwrap();
        let err = signals
            .wait_for(EventKind::ScriptReady, Duration::from_millis(100))
            .unwrap_err();
        match err {
            SignalError::Timeout { event, after } => {
                assert_eq!(event, EventKind::ScriptReady);
                assert_eq!(after, Duration::from_millis(100));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            signals.send(&StageEvent::ScriptReady),
            Err(SignalError::NotConnected)
        ));
    }
}
