//! The operation state machine and its controller.
//!
//! An [`Operation`] is a plain value: the pipeline inputs, the current
//! [`State`], the metrics and log tail accumulated so far, and the terminal
//! result once one exists. Every transition is a method on the value with no
//! I/O behind it, so the whole state table is unit-testable.
//!
//! The [`Controller`] is the effect boundary around that value: it runs the
//! privilege check, the unmount, the copy, and the shrink as supervised
//! subprocesses, feeds their output through the progress parser into the
//! operation, and reports everything to the caller as [`Event`]s.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::image;
use crate::platform::Caps;
use crate::process::{self, Channel, RunningProcess};
use crate::progress;
use crate::shrink;

/// How many raw output lines the diagnostic tail keeps.
pub const RECENT_LOG_LINES: usize = 6;

/// Copy direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Device → image file.
    Backup,
    /// Image file → device.
    Restore,
}

/// Pipeline states. `Completed` and `Errored` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Validating,
    Unmounting,
    Copying,
    Shrinking,
    Completed,
    Errored,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Errored)
    }
}

/// Copy-stage throughput figures, rebuilt from scratch at every copy-stage
/// entry. Shrink-stage output never touches these.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Cumulative bytes transferred, as last reported by the copy tool.
    /// Monotonically non-decreasing within one copy stage.
    pub bytes_copied: u64,
    /// The tool's own rate text, e.g. "104 MB/s".
    pub rate_text: String,
}

impl Metrics {
    /// Display figure in mebibytes. Totals are never queried, so no larger
    /// unit is needed.
    pub fn megabytes_copied(&self) -> f64 {
        self.bytes_copied as f64 / (1024.0 * 1024.0)
    }
}

/// The terminal outcome of one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunResult {
    Success { final_path: PathBuf },
    Failure { reason: String },
}

/// What the controller reports to the presentation layer.
#[derive(Clone, Debug)]
pub enum Event {
    State(State),
    Metrics(Metrics),
    Log(String),
    Terminal(RunResult),
}

/// How one supervised stage ended.
#[derive(Clone, Debug)]
pub enum StageOutcome {
    /// The subprocess terminated; `None` means it died to a signal.
    Exited(Option<i32>),
    /// The subprocess never started.
    LaunchFailed(String),
    /// The user confirmed cancellation and the subprocess tree was killed.
    Cancelled,
}

/// What [`Operation::ingest_chunk`] extracted from one raw output chunk.
#[derive(Debug, Default)]
pub struct ChunkDigest {
    /// Complete lines the chunk finished, for the log surface.
    pub lines: Vec<String>,
    /// True when the chunk moved the copy metrics.
    pub metrics_updated: bool,
}

/// One pipeline run: inputs, live state, and eventually a terminal result.
/// Exclusively owned by the controller for the lifetime of the run.
#[derive(Debug)]
pub struct Operation {
    pub mode: Mode,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub state: State,
    pub metrics: Metrics,
    /// Bounded diagnostic tail, oldest line evicted first.
    pub recent_log: VecDeque<String>,
    /// Most recent non-progress stderr line; becomes the failure reason when
    /// the copy tool exits non-zero.
    pub last_error_text: Option<String>,
    pub result: Option<RunResult>,
    stdout_buf: String,
    stderr_buf: String,
}

impl Operation {
    pub fn new(mode: Mode, source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            source: source.into(),
            destination: destination.into(),
            state: State::Idle,
            metrics: Metrics::default(),
            recent_log: VecDeque::with_capacity(RECENT_LOG_LINES),
            last_error_text: None,
            result: None,
            stdout_buf: String::new(),
            stderr_buf: String::new(),
        }
    }

    /// Idle → Validating. Records nothing new; inputs were fixed at
    /// construction and stay immutable for the whole run.
    pub fn begin(&mut self) {
        self.metrics = Metrics::default();
        self.state = State::Validating;
    }

    /// Errored → Validating, for the retry recovery path. Whether retry
    /// re-enters device selection instead is the presentation layer's call.
    pub fn retry(&mut self) {
        debug_assert_eq!(self.state, State::Errored);
        self.result = None;
        self.last_error_text = None;
        self.recent_log.clear();
        self.begin();
    }

    /// Validating: privilege check verdict.
    pub fn apply_privilege(&mut self, granted: bool) {
        if granted {
            self.state = State::Unmounting;
        } else {
            self.fail(Error::Privilege.reason());
        }
    }

    /// Unmounting (Backup only): the source device must exist before we try
    /// to read it.
    pub fn apply_source_probe(&mut self, exists: bool) {
        if !exists {
            self.fail(
                Error::SourceUnavailable {
                    path: self.source.clone(),
                }
                .reason(),
            );
        }
    }

    /// Unmounting → Copying, whatever the unmount did. An "already
    /// unmounted" exit is indistinguishable from a real failure without
    /// platform-specific parsing, and the copy stage fails clearly on its
    /// own if the device is genuinely inaccessible.
    pub fn apply_unmount(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Cancelled => self.fail(Error::Cancelled.reason()),
            StageOutcome::Exited(Some(0)) => self.enter_copying(),
            StageOutcome::Exited(code) => {
                warn!(?code, "unmount did not exit cleanly, proceeding anyway");
                self.enter_copying();
            }
            StageOutcome::LaunchFailed(message) => {
                warn!(reason = %message, "unmount tool failed to launch, proceeding anyway");
                self.enter_copying();
            }
        }
    }

    /// Enters the copy stage, resetting metrics: bytes belong to one copy
    /// stage only. The error line and partial-line buffers reset too, so a
    /// non-fatal complaint from the unmount stage can never masquerade as
    /// the copy tool's failure reason.
    pub fn enter_copying(&mut self) {
        self.metrics = Metrics::default();
        self.last_error_text = None;
        self.stdout_buf.clear();
        self.stderr_buf.clear();
        self.state = State::Copying;
    }

    /// Copying: exit 0 advances (Backup → Shrinking, Restore → Completed);
    /// anything else is fatal with the best reason available.
    pub fn apply_copy(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Cancelled => self.fail(Error::Cancelled.reason()),
            StageOutcome::Exited(Some(0)) => match self.mode {
                Mode::Backup => self.state = State::Shrinking,
                Mode::Restore => self.complete(),
            },
            StageOutcome::Exited(code) => {
                let reason = self.last_error_text.take().unwrap_or_else(|| match code {
                    Some(code) => format!("copy tool exited with code {code}"),
                    None => "copy tool was terminated by a signal".to_string(),
                });
                self.fail(Error::Copy { reason }.reason());
            }
            StageOutcome::LaunchFailed(message) => self.fail(message),
        }
    }

    /// Shrinking → Completed on every path except a confirmed cancel. The
    /// copy already produced a valid image; an optional optimization must
    /// not discard it.
    pub fn apply_shrink(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Cancelled => self.fail(Error::Cancelled.reason()),
            StageOutcome::Exited(Some(0)) => self.complete(),
            StageOutcome::Exited(code) => {
                warn!(?code, "shrink did not exit cleanly, keeping the unshrunk image");
                self.complete();
            }
            StageOutcome::LaunchFailed(message) => {
                warn!(reason = %message, "shrink unavailable, keeping the unshrunk image");
                self.complete();
            }
        }
    }

    pub fn complete(&mut self) {
        self.state = State::Completed;
        self.result = Some(RunResult::Success {
            final_path: self.destination.clone(),
        });
    }

    pub fn fail(&mut self, reason: String) {
        self.state = State::Errored;
        self.result = Some(RunResult::Failure { reason });
    }

    /// Folds one raw output chunk into the operation. Chunks are not
    /// line-aligned, so partial lines accumulate per channel until a line
    /// ending arrives; only complete lines reach the parser and the log.
    pub fn ingest_chunk(&mut self, channel: Channel, text: &str) -> ChunkDigest {
        let buf = match channel {
            Channel::Stdout => &mut self.stdout_buf,
            Channel::Stderr => &mut self.stderr_buf,
        };
        buf.push_str(text);

        let mut complete = Vec::new();
        while let Some(pos) = buf.find(['\n', '\r']) {
            let mut line: String = buf.drain(..=pos).collect();
            line.pop();
            complete.push(line);
        }

        let mut digest = ChunkDigest::default();
        for line in complete {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if self.recent_log.len() == RECENT_LOG_LINES {
                self.recent_log.pop_front();
            }
            self.recent_log.push_back(trimmed.to_string());

            let update = progress::parse(trimmed);
            if let Some(bytes) = update.bytes {
                // dd reports cumulative totals; never move backwards.
                self.metrics.bytes_copied = self.metrics.bytes_copied.max(bytes);
                digest.metrics_updated = true;
            }
            if let Some(rate) = update.rate_text {
                self.metrics.rate_text = rate;
                digest.metrics_updated = true;
            }
            if channel == Channel::Stderr && update.is_error_line {
                self.last_error_text = Some(trimmed.to_string());
            }

            digest.lines.push(trimmed.to_string());
        }

        digest
    }
}

/// Drives one operation at a time through the pipeline, supervising the
/// external tools and emitting [`Event`]s to a single sink.
pub struct Controller {
    caps: &'static Caps,
    running: Arc<AtomicBool>,
    shrink_enabled: bool,
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Controller {
    /// `running` is the shared cancellation flag: the front-end arms it
    /// (after its own confirmation prompt) by storing `false`.
    pub fn new(running: Arc<AtomicBool>) -> Self {
        Self {
            caps: Caps::current(),
            running,
            shrink_enabled: true,
            busy: AtomicBool::new(false),
        }
    }

    /// Skip the shrink stage entirely.
    pub fn without_shrink(mut self) -> Self {
        self.shrink_enabled = false;
        self
    }

    /// Runs one full pipeline. Returns [`Error::Busy`] without starting
    /// anything if another operation is still in flight; any failure of the
    /// operation itself is reported through the terminal event and the
    /// returned [`RunResult`].
    pub fn start(
        &self,
        mode: Mode,
        source: PathBuf,
        destination: PathBuf,
        sink: &mut dyn FnMut(Event),
    ) -> Result<RunResult> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        let _guard = BusyGuard(&self.busy);

        // Prefer the raw device node for the device side of the copy.
        let (source, destination) = match mode {
            Mode::Backup => (self.caps.raw_path(&source), destination),
            Mode::Restore => (source, self.caps.raw_path(&destination)),
        };

        let mut op = Operation::new(mode, source, destination);
        op.begin();
        sink(Event::State(op.state));

        self.validate(&mut op, sink);
        if !op.state.is_terminal() {
            self.unmount(&mut op, sink);
        }
        if !op.state.is_terminal() {
            self.copy(&mut op, sink);
        }
        if op.state == State::Shrinking {
            self.shrink(&mut op, sink);
        }

        let result = op.result.clone().unwrap_or(RunResult::Failure {
            reason: "operation ended in an unexpected state".to_string(),
        });
        sink(Event::Terminal(result.clone()));
        Ok(result)
    }

    /// Validating: raw device access needs elevated privileges. Root skips
    /// the prompt; everyone else authenticates through sudo's own terminal
    /// prompt, which also caches the timestamp the later stages reuse.
    fn validate(&self, op: &mut Operation, sink: &mut dyn FnMut(Event)) {
        if process::is_root() {
            op.apply_privilege(true);
            sink(Event::State(op.state));
            return;
        }

        match process::run_interactive("sudo", &["-v".to_string()]) {
            Ok(Some(0)) => op.apply_privilege(true),
            Ok(_) => op.apply_privilege(false),
            Err(e) => op.fail(e.reason()),
        }
        sink(Event::State(op.state));
    }

    /// Unmounting: best-effort force unmount of the device being copied
    /// from (Backup) or onto (Restore). A pass-through when the path has no
    /// disk identifier or the platform has no identifier-based unmount.
    fn unmount(&self, op: &mut Operation, sink: &mut dyn FnMut(Event)) {
        if op.mode == Mode::Backup {
            op.apply_source_probe(op.source.exists());
            if op.state.is_terminal() {
                sink(Event::State(op.state));
                return;
            }
        }

        let device_path = match op.mode {
            Mode::Backup => op.source.clone(),
            Mode::Restore => op.destination.clone(),
        };

        let command = self
            .caps
            .disk_identifier(&device_path)
            .and_then(|id| self.caps.unmount_command(&id));

        let outcome = match command {
            Some((program, args)) => match process::spawn(program, &args, true) {
                Ok(proc) => self.supervise(proc, op, sink),
                Err(e) => StageOutcome::LaunchFailed(e.reason()),
            },
            None => StageOutcome::Exited(Some(0)),
        };

        if let StageOutcome::Exited(Some(code)) = outcome {
            if code != 0 {
                sink(Event::Log(format!(
                    "warning: unmount exited with code {code}, continuing"
                )));
            }
        }
        op.apply_unmount(outcome);
        sink(Event::State(op.state));
    }

    /// Copying: the one stage whose metrics the operation tracks. Restore
    /// sources with a compressed suffix run as a decompressor piped into the
    /// copy tool; the decision is made once, here.
    fn copy(&self, op: &mut Operation, sink: &mut dyn FnMut(Event)) {
        sink(Event::Metrics(op.metrics.clone()));
        info!(mode = ?op.mode, source = %op.source.display(), destination = %op.destination.display(), "starting copy");

        let spawned = match op.mode {
            Mode::Restore => match image::decompressor(&op.source) {
                Some(decomp) => process::spawn_piped(
                    &decomp,
                    "dd",
                    &self.caps.copy_args_from_stdin(&op.destination),
                    true,
                ),
                None => process::spawn(
                    "dd",
                    &self.caps.copy_args(&op.source, &op.destination),
                    true,
                ),
            },
            Mode::Backup => process::spawn(
                "dd",
                &self.caps.copy_args(&op.source, &op.destination),
                true,
            ),
        };

        let outcome = match spawned {
            Ok(proc) => self.supervise(proc, op, sink),
            Err(e) => StageOutcome::LaunchFailed(e.reason()),
        };
        op.apply_copy(outcome);
        sink(Event::State(op.state));
    }

    /// Shrinking: best-effort, never fatal. The tool is fetched on first use
    /// and every failure along the way degrades to "keep the unshrunk
    /// image".
    fn shrink(&self, op: &mut Operation, sink: &mut dyn FnMut(Event)) {
        if !self.shrink_enabled {
            sink(Event::Log("shrink disabled, keeping the image as copied".to_string()));
            op.complete();
            sink(Event::State(op.state));
            return;
        }

        let outcome = match shrink::ensure_tool() {
            Some(tool) => {
                let args = vec![
                    tool.to_string_lossy().to_string(),
                    op.destination.to_string_lossy().to_string(),
                ];
                match process::spawn("bash", &args, true) {
                    Ok(proc) => self.supervise(proc, op, sink),
                    Err(e) => StageOutcome::LaunchFailed(e.reason()),
                }
            }
            None => StageOutcome::LaunchFailed("shrink tool unavailable".to_string()),
        };

        if !matches!(outcome, StageOutcome::Exited(Some(0)) | StageOutcome::Cancelled) {
            sink(Event::Log(
                "warning: shrink skipped, the image is valid as copied".to_string(),
            ));
        }
        op.apply_shrink(outcome);
        sink(Event::State(op.state));
    }

    /// Pumps one supervised subprocess to completion: output chunks fold
    /// into the operation and fan out as log/metric events in arrival
    /// order; the cancellation flag is polled between chunks and a
    /// confirmed cancel kills the whole tree.
    fn supervise(
        &self,
        mut proc: RunningProcess,
        op: &mut Operation,
        sink: &mut dyn FnMut(Event),
    ) -> StageOutcome {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                warn!(command = proc.command(), "cancel confirmed, killing subprocess tree");
                proc.kill();
                let _ = proc.wait();
                return StageOutcome::Cancelled;
            }

            match proc.events.recv_timeout(Duration::from_millis(100)) {
                Ok(chunk) => {
                    let digest = op.ingest_chunk(chunk.channel, &chunk.text);
                    for line in digest.lines {
                        sink(Event::Log(line));
                    }
                    if digest.metrics_updated {
                        sink(Event::Metrics(op.metrics.clone()));
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        match proc.wait() {
            Ok(code) => StageOutcome::Exited(code),
            Err(e) => StageOutcome::LaunchFailed(format!("could not reap subprocess: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup() -> Operation {
        Operation::new(Mode::Backup, "/dev/rdisk9", "/tmp/out.img")
    }

    fn restore() -> Operation {
        Operation::new(Mode::Restore, "/tmp/in.img", "/dev/rdisk9")
    }

    #[test]
    fn begin_enters_validating_with_fresh_metrics() {
        let mut op = backup();
        op.metrics.bytes_copied = 99;
        op.begin();
        assert_eq!(op.state, State::Validating);
        assert_eq!(op.metrics.bytes_copied, 0);
    }

    #[test]
    fn privilege_failure_is_fatal_with_authentication_reason() {
        let mut op = backup();
        op.begin();
        op.apply_privilege(false);
        assert_eq!(op.state, State::Errored);
        match op.result.unwrap() {
            RunResult::Failure { reason } => assert!(reason.contains("authentication failed")),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn missing_backup_source_is_fatal() {
        let mut op = backup();
        op.begin();
        op.apply_privilege(true);
        op.apply_source_probe(false);
        assert_eq!(op.state, State::Errored);
    }

    #[test]
    fn any_unmount_exit_reaches_copying() {
        for outcome in [
            StageOutcome::Exited(Some(0)),
            StageOutcome::Exited(Some(1)),
            StageOutcome::Exited(None),
            StageOutcome::LaunchFailed("no diskutil".to_string()),
        ] {
            let mut op = backup();
            op.begin();
            op.apply_privilege(true);
            op.apply_unmount(outcome);
            assert_eq!(op.state, State::Copying);
        }
    }

    #[test]
    fn copy_success_branches_by_mode() {
        let mut op = backup();
        op.enter_copying();
        op.apply_copy(StageOutcome::Exited(Some(0)));
        assert_eq!(op.state, State::Shrinking);

        let mut op = restore();
        op.enter_copying();
        op.apply_copy(StageOutcome::Exited(Some(0)));
        assert_eq!(op.state, State::Completed);
    }

    #[test]
    fn copy_failure_reason_is_the_last_error_line() {
        let mut op = backup();
        op.enter_copying();
        op.ingest_chunk(Channel::Stderr, "dd: /dev/rdisk9: Resource busy\n");
        op.apply_copy(StageOutcome::Exited(Some(1)));
        assert_eq!(op.state, State::Errored);
        assert_eq!(
            op.result.unwrap(),
            RunResult::Failure {
                reason: "dd: /dev/rdisk9: Resource busy".to_string()
            }
        );
    }

    #[test]
    fn unmount_stderr_never_becomes_the_copy_failure_reason() {
        let mut op = backup();
        op.begin();
        op.apply_privilege(true);
        op.ingest_chunk(
            Channel::Stderr,
            "Unmount of disk9 failed: at least one volume could not be unmounted\n",
        );
        op.apply_unmount(StageOutcome::Exited(Some(1)));
        assert_eq!(op.last_error_text, None);
        op.apply_copy(StageOutcome::Exited(Some(1)));
        match op.result.unwrap() {
            RunResult::Failure { reason } => {
                assert!(reason.contains("code 1"), "got {reason:?}");
                assert!(!reason.contains("Unmount"), "got {reason:?}");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn unmount_partial_line_never_leaks_into_copy_output() {
        let mut op = backup();
        op.begin();
        op.apply_privilege(true);
        op.ingest_chunk(Channel::Stderr, "Unmount of disk9 fail");
        op.apply_unmount(StageOutcome::Exited(Some(1)));
        op.ingest_chunk(Channel::Stderr, "dd: /dev/rdisk9: Resource busy\n");
        assert_eq!(
            op.last_error_text.as_deref(),
            Some("dd: /dev/rdisk9: Resource busy")
        );
    }

    #[test]
    fn copy_failure_falls_back_to_exit_code_text() {
        let mut op = backup();
        op.enter_copying();
        op.apply_copy(StageOutcome::Exited(Some(1)));
        match op.result.unwrap() {
            RunResult::Failure { reason } => assert!(reason.contains("code 1")),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn progress_chatter_never_becomes_the_failure_reason() {
        let mut op = backup();
        op.enter_copying();
        op.ingest_chunk(Channel::Stderr, "1024+0 records in\n1024+0 records out\n");
        op.ingest_chunk(
            Channel::Stderr,
            "1073741824 bytes (1.1 GB) copied, 10 s, 104 MB/s\n",
        );
        assert_eq!(op.last_error_text, None);
    }

    #[test]
    fn every_shrink_failure_still_completes() {
        for outcome in [
            StageOutcome::Exited(Some(1)),
            StageOutcome::Exited(Some(255)),
            StageOutcome::Exited(None),
            StageOutcome::LaunchFailed("shrink tool unavailable".to_string()),
        ] {
            let mut op = backup();
            op.enter_copying();
            op.apply_copy(StageOutcome::Exited(Some(0)));
            op.apply_shrink(outcome);
            assert_eq!(op.state, State::Completed);
        }
    }

    #[test]
    fn backup_round_trip_with_failed_shrink() {
        let mut op = backup();
        op.begin();
        op.apply_privilege(true);
        op.apply_source_probe(true);
        op.apply_unmount(StageOutcome::Exited(Some(0)));
        op.ingest_chunk(
            Channel::Stderr,
            "15728640 bytes transferred in 2.0 secs (7864320 bytes/sec)\n",
        );
        op.apply_copy(StageOutcome::Exited(Some(0)));
        op.apply_shrink(StageOutcome::Exited(Some(1)));

        assert_eq!(op.state, State::Completed);
        assert_eq!(
            op.result.unwrap(),
            RunResult::Success {
                final_path: PathBuf::from("/tmp/out.img")
            }
        );
    }

    #[test]
    fn cancelled_copy_errors_with_cancel_reason() {
        let mut op = restore();
        op.enter_copying();
        op.apply_copy(StageOutcome::Cancelled);
        assert_eq!(op.state, State::Errored);
        assert_eq!(
            op.result.unwrap(),
            RunResult::Failure {
                reason: "cancelled by user".to_string()
            }
        );
    }

    #[test]
    fn split_chunks_reassemble_into_lines() {
        let mut op = backup();
        op.enter_copying();
        let first = op.ingest_chunk(Channel::Stderr, "1073741824 byt");
        assert!(first.lines.is_empty());
        assert_eq!(op.metrics.bytes_copied, 0);

        let second = op.ingest_chunk(Channel::Stderr, "es (1.1 GB) copied, 10 s, 104 MB/s\n");
        assert_eq!(second.lines.len(), 1);
        assert_eq!(op.metrics.bytes_copied, 1_073_741_824);
        assert!(op.metrics.rate_text.contains("104"));
    }

    #[test]
    fn bytes_never_move_backwards_within_a_stage() {
        let mut op = backup();
        op.enter_copying();
        op.ingest_chunk(Channel::Stderr, "2048 bytes (2 kB) copied, 1 s, 2 kB/s\n");
        op.ingest_chunk(Channel::Stderr, "1024 bytes (1 kB) copied, 1 s, 1 kB/s\n");
        assert_eq!(op.metrics.bytes_copied, 2048);
    }

    #[test]
    fn metrics_reset_at_copy_stage_entry() {
        let mut op = backup();
        op.enter_copying();
        op.ingest_chunk(Channel::Stderr, "4096 bytes (4 kB) copied, 1 s, 4 kB/s\n");
        assert_eq!(op.metrics.bytes_copied, 4096);
        op.enter_copying();
        assert_eq!(op.metrics.bytes_copied, 0);
    }

    #[test]
    fn recent_log_is_bounded() {
        let mut op = backup();
        op.enter_copying();
        for i in 0..10 {
            op.ingest_chunk(Channel::Stdout, &format!("line {i}\n"));
        }
        assert_eq!(op.recent_log.len(), RECENT_LOG_LINES);
        assert_eq!(op.recent_log.front().unwrap(), "line 4");
        assert_eq!(op.recent_log.back().unwrap(), "line 9");
    }

    #[test]
    fn megabyte_figure_divides_by_1024_squared() {
        let metrics = Metrics {
            bytes_copied: 3 * 1024 * 1024,
            rate_text: String::new(),
        };
        assert!((metrics.megabytes_copied() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn retry_reenters_validating_clean() {
        let mut op = backup();
        op.begin();
        op.apply_privilege(false);
        assert_eq!(op.state, State::Errored);
        op.retry();
        assert_eq!(op.state, State::Validating);
        assert!(op.result.is_none());
        assert!(op.recent_log.is_empty());
    }
}
