//! Actuator link: fire-and-forget ASCII commands with optional byte telemetry.

use super::synthetic::SimStage;
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Single forward step sent by the `F` opcode and the manual jog.
pub const STEP_FORWARD: &str = "F0.12";
/// Single backward step sent by the `B` opcode and the manual jog.
pub const STEP_BACKWARD: &str = "B0.12";

const STEP_MM: f64 = 0.12;
const MAX_TELEMETRY_LINE: usize = 1024;

pub trait Actuator: Send {
    /// Send one command; the newline terminator is appended here.
    fn write(&mut self, command: &str) -> io::Result<()>;
    fn is_data_available(&mut self) -> bool;
    fn read_byte(&mut self, timeout: Duration) -> Option<u8>;
    fn describe(&self) -> String;
}

/// Serial device opened as a character file. Line settings (baud rate,
/// framing) are expected to be configured on the port beforehand.
///
/// Telemetry is read on a `serial-rx` thread holding a clone of the port.
/// A blocking `read` cannot be interrupted, so after the actuator is dropped
/// that thread exits on its next read result: the next byte fails to send,
/// or EOF/error ends the loop. Drop joins it when it has already finished.
pub struct SerialActuator {
    path: PathBuf,
    port: File,
    rx: mpsc::Receiver<u8>,
    pending: VecDeque<u8>,
    reader: Option<JoinHandle<()>>,
}

impl SerialActuator {
    pub fn open(path: &Path) -> io::Result<Self> {
        let port = OpenOptions::new().read(true).write(true).open(path)?;
        let mut reader = port.try_clone()?;
        let (tx, rx) = mpsc::channel::<u8>();
        let label = path.display().to_string();
        let reader = std::thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                let mut buf = [0u8; 256];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if buf[..n].iter().any(|&b| tx.send(b).is_err()) {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(port = %label, error = %e, "serial read failed");
                            break;
                        }
                    }
                }
                debug!(port = %label, "serial reader stopped");
            })?;
        info!(port = %path.display(), "serial actuator opened");
        Ok(Self {
            path: path.to_path_buf(),
            port,
            rx,
            pending: VecDeque::new(),
            reader: Some(reader),
        })
    }
}

impl Drop for SerialActuator {
    fn drop(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        if reader.is_finished() {
            let _ = reader.join();
        } else {
            debug!(port = %self.path.display(), "serial reader exits on its next read");
        }
    }
}

impl Actuator for SerialActuator {
    fn write(&mut self, command: &str) -> io::Result<()> {
        debug!(command, "serial write");
        self.port.write_all(command.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }

    fn is_data_available(&mut self) -> bool {
        if self.pending.is_empty() {
            if let Ok(b) = self.rx.try_recv() {
                self.pending.push_back(b);
            }
        }
        !self.pending.is_empty()
    }

    fn read_byte(&mut self, timeout: Duration) -> Option<u8> {
        if let Some(b) = self.pending.pop_front() {
            return Some(b);
        }
        self.rx.recv_timeout(timeout).ok()
    }

    fn describe(&self) -> String {
        format!("serial {}", self.path.display())
    }
}

/// Logs commands instead of sending them.
#[derive(Debug, Default)]
pub struct DryRunActuator {
    sent: u64,
}

impl Actuator for DryRunActuator {
    fn write(&mut self, command: &str) -> io::Result<()> {
        self.sent += 1;
        info!(command, sent = self.sent, "dry-run actuator");
        Ok(())
    }

    fn is_data_available(&mut self) -> bool {
        false
    }

    fn read_byte(&mut self, _timeout: Duration) -> Option<u8> {
        None
    }

    fn describe(&self) -> String {
        "dry-run".into()
    }
}

/// Drives the simulated stage: step commands move it, every command is
/// acknowledged with an `OK <command>` telemetry line.
pub struct SimActuator {
    stage: SimStage,
    replies: VecDeque<u8>,
}

impl SimActuator {
    pub fn new(stage: SimStage) -> Self {
        Self {
            stage,
            replies: VecDeque::new(),
        }
    }
}

impl Actuator for SimActuator {
    fn write(&mut self, command: &str) -> io::Result<()> {
        if command.starts_with('F') {
            self.stage.move_by_mm(STEP_MM);
        } else if command.starts_with('B') {
            self.stage.move_by_mm(-STEP_MM);
        }
        self.replies
            .extend(format!("OK {command} @ {:.3}mm\n", self.stage.position_mm()).bytes());
        Ok(())
    }

    fn is_data_available(&mut self) -> bool {
        !self.replies.is_empty()
    }

    fn read_byte(&mut self, _timeout: Duration) -> Option<u8> {
        self.replies.pop_front()
    }

    fn describe(&self) -> String {
        "simulated stage".into()
    }
}

/// Frames actuator telemetry bytes into lines.
#[derive(Debug, Default)]
pub struct TelemetryLines {
    buf: BytesMut,
}

impl TelemetryLines {
    /// Drain whatever the actuator has buffered without waiting.
    pub fn drain(&mut self, actuator: &mut dyn Actuator) -> Vec<String> {
        let mut lines = Vec::new();
        while actuator.is_data_available() {
            let Some(b) = actuator.read_byte(Duration::ZERO) else {
                break;
            };
            if b == b'\n' || self.buf.len() >= MAX_TELEMETRY_LINE {
                if b != b'\n' {
                    self.buf.put_u8(b);
                }
                let line = self.buf.split();
                let text = String::from_utf8_lossy(&line).trim_end().to_string();
                if !text.is_empty() {
                    lines.push(text);
                }
            } else {
                self.buf.put_u8(b);
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_actuator_moves_stage_and_acknowledges() {
        let stage = SimStage::default();
        let mut act = SimActuator::new(stage.clone());
        act.write(STEP_FORWARD).unwrap();
        act.write(STEP_FORWARD).unwrap();
        act.write(STEP_BACKWARD).unwrap();
        act.write("W0005").unwrap();
        assert!((stage.position_mm() - 0.12).abs() < 1e-9);

        let mut telemetry = TelemetryLines::default();
        let lines = telemetry.drain(&mut act);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "OK F0.12 @ 0.120mm");
        assert_eq!(lines[3], "OK W0005 @ 0.120mm");
        assert!(!act.is_data_available());
    }

    #[test]
    fn device_port_reads_telemetry_until_eof() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ttyFAKE");
        std::fs::write(&path, b"OK\n").unwrap();
        let mut act = SerialActuator::open(&path).unwrap();

        let mut got = Vec::new();
        while got.len() < 3 {
            match act.read_byte(Duration::from_secs(2)) {
                Some(b) => got.push(b),
                None => panic!("telemetry never arrived: {got:?}"),
            }
        }
        assert_eq!(got, b"OK\n");

        // A regular file hits EOF, so the reader ends on its own.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !act.reader.as_ref().is_some_and(|r| r.is_finished()) {
            assert!(std::time::Instant::now() < deadline, "reader never stopped");
            std::thread::sleep(Duration::from_millis(5));
        }
        act.write(STEP_FORWARD).unwrap();
        assert!(!act.is_data_available());
        drop(act);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with("F0.12\n"));
    }

    #[test]
    fn partial_telemetry_line_is_kept_for_next_drain() {
        struct Scripted(VecDeque<u8>);
        impl Actuator for Scripted {
            fn write(&mut self, _: &str) -> io::Result<()> {
                Ok(())
            }
            fn is_data_available(&mut self) -> bool {
                !self.0.is_empty()
            }
            fn read_byte(&mut self, _: Duration) -> Option<u8> {
                self.0.pop_front()
            }
            fn describe(&self) -> String {
                "scripted".into()
            }
        }

        let mut link = Scripted(b"POS 1".iter().copied().collect());
        let mut telemetry = TelemetryLines::default();
        assert!(telemetry.drain(&mut link).is_empty());
        link.0.extend(b"2\r\nPOS 13\n");
        assert_eq!(telemetry.drain(&mut link), vec!["POS 12", "POS 13"]);
    }
}
