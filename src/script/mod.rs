//! Actuator script interpreter.
//!
//! [`ScriptRun`] executes at most one command per tick and never blocks:
//! repeated moves (`F`/`B`) and holds (`W`) keep the program counter in place
//! across ticks until their condition is met.

pub mod parse;
pub mod series;

use crate::devices::serial::{Actuator, STEP_BACKWARD, STEP_FORWARD};
use crate::model::{Axis, SubsetRecord};
use anyhow::{Context, Result};
pub use parse::{load_script, Command};
pub use series::{Plotter, SampleSeries, SeriesPlotter};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Script not loaded or already ended.
    Inert,
    /// The current command needs more ticks.
    Held,
    Advanced,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub step: Step,
    /// Command written to the actuator on this tick.
    pub sent: Option<String>,
}

impl TickReport {
    fn new(step: Step) -> Self {
        Self { step, sent: None }
    }
}

/// Collaborators the interpreter touches during a tick.
pub struct ScriptIo<'a> {
    pub actuator: &'a mut dyn Actuator,
    pub plotter: &'a mut dyn Plotter,
    pub subsets: &'a [SubsetRecord],
}

pub struct ScriptRun {
    program: Vec<Command>,
    pc: usize,
    last_pc: Option<usize>,
    iterator_count: u32,
    sample_interval: Option<Duration>,
    last_sent_at: Option<Instant>,
    last_sample_at: Option<Instant>,
    started_at: Option<Instant>,
    loaded: bool,
    series: SampleSeries,
}

impl ScriptRun {
    pub fn new(program: Vec<Command>, axis: Axis) -> Self {
        info!(commands = program.len(), "script loaded");
        Self {
            program,
            pc: 0,
            last_pc: None,
            iterator_count: 0,
            sample_interval: None,
            last_sent_at: None,
            last_sample_at: None,
            started_at: None,
            loaded: true,
            series: SampleSeries::new(axis),
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn iterator_count(&self) -> u32 {
        self.iterator_count
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[cfg(test)]
    pub fn sample_interval(&self) -> Option<Duration> {
        self.sample_interval
    }

    pub fn series(&self) -> &SampleSeries {
        &self.series
    }

    fn advance(&mut self) -> Step {
        self.pc += 1;
        self.iterator_count = 0;
        Step::Advanced
    }

    fn send(&mut self, io: &mut ScriptIo<'_>, command: String) -> Result<String> {
        io.actuator
            .write(&command)
            .with_context(|| format!("send {command} to {}", io.actuator.describe()))?;
        debug!(command = %command, pc = self.pc, "script sent");
        Ok(command)
    }

    pub fn tick(&mut self, now: Instant, io: &mut ScriptIo<'_>) -> Result<TickReport> {
        if !self.loaded {
            return Ok(TickReport::new(Step::Inert));
        }
        let started = *self.started_at.get_or_insert(now);
        if self.last_pc != Some(self.pc) {
            self.iterator_count = 0;
            self.last_pc = Some(self.pc);
        }

        if let Some(interval) = self.sample_interval {
            let due = self
                .last_sample_at
                .map_or(true, |at| now.saturating_duration_since(at) > interval);
            if due {
                self.series.push(io.subsets);
                self.last_sample_at = Some(now);
            }
        }

        let Some(command) = self.program.get(self.pc).copied() else {
            warn!(pc = self.pc, "script ran past its last line without END");
            self.loaded = false;
            return Ok(TickReport::new(Step::Ended));
        };

        let mut report = TickReport::new(Step::Held);
        report.step = match command {
            Command::SampleInterval(tenths) => {
                self.sample_interval =
                    (tenths > 0).then(|| Duration::from_millis(u64::from(tenths) * 100));
                self.advance()
            }
            Command::Setpoint { opcode, value } => {
                let wire = format!("{}{value:04}", opcode.wire_prefix());
                report.sent = Some(self.send(io, wire)?);
                self.last_sent_at = Some(now);
                self.advance()
            }
            Command::Forward(n) | Command::Backward(n) => {
                let step = if matches!(command, Command::Forward(_)) {
                    STEP_FORWARD
                } else {
                    STEP_BACKWARD
                };
                report.sent = Some(self.send(io, step.to_string())?);
                self.iterator_count += 1;
                if self.iterator_count >= n {
                    self.last_sent_at = Some(now);
                    self.advance()
                } else {
                    Step::Held
                }
            }
            Command::Wait(secs) => {
                let since = self.last_sent_at.unwrap_or(started);
                if now.saturating_duration_since(since) > Duration::from_secs(u64::from(secs)) {
                    self.last_sent_at = Some(now);
                    self.advance()
                } else {
                    Step::Held
                }
            }
            Command::Draw => {
                // A failed draw is reported once, not retried every tick.
                let drawn = io.plotter.draw(&self.series);
                self.advance();
                drawn?;
                Step::Advanced
            }
            Command::End => {
                info!(samples = self.series.len(), "script finished");
                self.loaded = false;
                Step::Ended
            }
        };
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::parse::parse_script;
    use super::*;
    use std::io;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<String>,
    }

    impl Actuator for Recorder {
        fn write(&mut self, command: &str) -> io::Result<()> {
            self.sent.push(command.to_string());
            Ok(())
        }
        fn is_data_available(&mut self) -> bool {
            false
        }
        fn read_byte(&mut self, _: Duration) -> Option<u8> {
            None
        }
        fn describe(&self) -> String {
            "recorder".into()
        }
    }

    #[derive(Default)]
    struct Canvas {
        draws: Vec<usize>,
    }

    impl Plotter for Canvas {
        fn draw(&mut self, series: &SampleSeries) -> Result<()> {
            self.draws.push(series.len());
            Ok(())
        }
    }

    struct Bench {
        run: ScriptRun,
        actuator: Recorder,
        canvas: Canvas,
        subsets: Vec<SubsetRecord>,
        t0: Instant,
    }

    impl Bench {
        fn new(source: &str) -> Self {
            let mut subset = SubsetRecord::new(0, 10.0, 10.0, 21);
            subset.displacement_z = 0.25;
            Self {
                run: ScriptRun::new(parse_script(source).unwrap(), Axis::Z),
                actuator: Recorder::default(),
                canvas: Canvas::default(),
                subsets: vec![subset],
                t0: Instant::now(),
            }
        }

        fn tick_at(&mut self, ms: u64) -> TickReport {
            let mut io = ScriptIo {
                actuator: &mut self.actuator,
                plotter: &mut self.canvas,
                subsets: &self.subsets,
            };
            self.run
                .tick(self.t0 + Duration::from_millis(ms), &mut io)
                .unwrap()
        }
    }

    #[test]
    fn repeat_counter_holds_pc_until_count_reached() {
        let mut b = Bench::new("S02\nF03\nW01\nEND");
        assert_eq!(b.tick_at(0).step, Step::Advanced);
        assert_eq!(b.run.pc(), 1);

        assert_eq!(b.tick_at(10).step, Step::Held);
        assert_eq!((b.run.pc(), b.run.iterator_count()), (1, 1));
        assert_eq!(b.tick_at(20).step, Step::Held);
        assert_eq!((b.run.pc(), b.run.iterator_count()), (1, 2));
        assert_eq!(b.tick_at(30).step, Step::Advanced);
        assert_eq!((b.run.pc(), b.run.iterator_count()), (2, 0));
        assert_eq!(b.actuator.sent, vec!["F0.12"; 3]);
    }

    #[test]
    fn setpoint_then_wait_measures_from_send() {
        let mut b = Bench::new("S01\nG0005\nW02\nEND");
        assert_eq!(b.tick_at(0).step, Step::Advanced);
        assert_eq!(b.run.sample_interval(), Some(Duration::from_millis(100)));

        let report = b.tick_at(50);
        assert_eq!(report.step, Step::Advanced);
        assert_eq!(report.sent.as_deref(), Some("W0005"));

        for ms in [60, 1000, 2000, 2050] {
            assert_eq!(b.tick_at(ms).step, Step::Held, "at {ms} ms");
        }
        assert_eq!(b.tick_at(2051).step, Step::Advanced);
        assert_eq!(b.tick_at(2100).step, Step::Ended);
        assert!(!b.run.is_loaded());

        for ms in [2200, 5000, 9000] {
            assert_eq!(b.tick_at(ms), TickReport::new(Step::Inert));
        }
        assert_eq!(b.actuator.sent, vec!["W0005"]);
    }

    #[test]
    fn setpoint_opcodes_use_their_wire_prefix() {
        let mut b = Bench::new("G12\nV 0340\nT7\nEND");
        for ms in 0..3 {
            b.tick_at(ms);
        }
        assert_eq!(b.actuator.sent, vec!["W0012", "X0340", "T0007"]);
    }

    #[test]
    fn samples_at_most_once_per_interval() {
        let mut b = Bench::new("S02\nW09\nEND");
        b.tick_at(0);
        // Ticks every 30 ms for one second against a 200 ms interval.
        for ms in (30..=1000).step_by(30) {
            b.tick_at(ms);
        }
        let samples = b.run.series().len();
        assert!((4..=5).contains(&samples), "{samples} samples");
        assert_eq!(b.run.series().values[0][0], 0.25);
    }

    #[test]
    fn no_sampling_before_interval_is_set() {
        let mut b = Bench::new("W01\nS01\nEND");
        b.tick_at(0);
        b.tick_at(500);
        assert!(b.run.series().is_empty());
    }

    #[test]
    fn wait_before_any_send_measures_from_start() {
        let mut b = Bench::new("W01\nEND");
        assert_eq!(b.tick_at(100).step, Step::Held);
        assert_eq!(b.tick_at(1100).step, Step::Held);
        assert_eq!(b.tick_at(1101).step, Step::Advanced);
    }

    #[test]
    fn draw_hands_series_to_plotter() {
        let mut b = Bench::new("S01\nDRAW\nEND");
        b.tick_at(0);
        b.tick_at(10);
        assert_eq!(b.canvas.draws, vec![1]);
        assert_eq!(b.run.pc(), 2);
    }

    #[test]
    fn backward_sends_step_every_tick() {
        let mut b = Bench::new("B02\nEND");
        b.tick_at(0);
        b.tick_at(1);
        assert_eq!(b.actuator.sent, vec!["B0.12", "B0.12"]);
        assert_eq!(b.run.pc(), 1);
    }

    #[test]
    fn running_off_the_end_behaves_like_end() {
        let mut b = Bench::new("S01");
        assert_eq!(b.tick_at(0).step, Step::Advanced);
        assert_eq!(b.tick_at(1).step, Step::Ended);
        assert_eq!(b.tick_at(2).step, Step::Inert);
    }

    #[test]
    fn failed_send_does_not_advance() {
        struct Broken;
        impl Actuator for Broken {
            fn write(&mut self, _: &str) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
            }
            fn is_data_available(&mut self) -> bool {
                false
            }
            fn read_byte(&mut self, _: Duration) -> Option<u8> {
                None
            }
            fn describe(&self) -> String {
                "broken".into()
            }
        }
        let mut run = ScriptRun::new(parse_script("G0001\nEND").unwrap(), Axis::Z);
        let mut canvas = Canvas::default();
        let mut io = ScriptIo {
            actuator: &mut Broken,
            plotter: &mut canvas,
            subsets: &[],
        };
        assert!(run.tick(Instant::now(), &mut io).is_err());
        assert_eq!(run.pc(), 0);
        assert!(run.is_loaded());
    }
}
