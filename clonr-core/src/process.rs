//! Spawning and supervising the external tools.
//!
//! Every stage of an operation delegates its real work to a subprocess
//! (`dd`, `diskutil`, `gzip`, PiShrink, …). This module owns the plumbing:
//! starting a child (optionally under `sudo`), pumping its stdout and stderr
//! into an event channel as raw text chunks, and exposing the exit status.
//!
//! A failure to *launch* (binary missing, permission denied) is reported as
//! [`Error::Launch`] before any event flows; it is a different failure class
//! from a child that started and exited non-zero.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::debug;

use crate::error::{Error, Result};
use crate::image::Decompressor;

/// Which stream a chunk arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

/// A raw text chunk from a running child. Chunks are whatever `read` hands
/// back: they may split or merge lines, and consumers must cope.
#[derive(Clone, Debug)]
pub struct OutputChunk {
    pub channel: Channel,
    pub text: String,
}

/// A supervised child process (or a two-child pipeline). Events arrive on
/// `events` until both pump threads hit end-of-stream; `wait` then reaps the
/// children and yields the status-bearing exit code.
#[derive(Debug)]
pub struct RunningProcess {
    // For a pipeline the last child is the status-bearing one.
    children: Vec<Child>,
    pub events: Receiver<OutputChunk>,
    command: String,
}

fn build_command(program: &str, args: &[String], elevate: bool) -> Command {
    // A cached sudo timestamp from the validation stage keeps later elevated
    // stages from prompting again.
    if elevate && !is_root() {
        let mut cmd = Command::new("sudo");
        cmd.arg(program).args(args);
        // Inherited stdin lets an interactive sudo prompt reach the
        // terminal; it is the only state shared with the outer session.
        cmd.stdin(Stdio::inherit());
        cmd
    } else {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd
    }
}

#[cfg(unix)]
pub(crate) fn is_root() -> bool {
    // Safety: geteuid has no failure modes.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub(crate) fn is_root() -> bool {
    false
}

fn pump(mut stream: impl Read + Send + 'static, channel: Channel, tx: Sender<OutputChunk>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send(OutputChunk { channel, text }).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Spawns one external tool with both output streams captured.
pub fn spawn(program: &str, args: &[String], elevate: bool) -> Result<RunningProcess> {
    debug!(program, elevate, "spawning");
    let mut child = build_command(program, args, elevate)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::Launch {
            command: program.to_string(),
            source,
        })?;

    let (tx, events) = mpsc::channel();
    if let Some(out) = child.stdout.take() {
        pump(out, Channel::Stdout, tx.clone());
    }
    if let Some(err) = child.stderr.take() {
        pump(err, Channel::Stderr, tx);
    }

    Ok(RunningProcess {
        children: vec![child],
        events,
        command: program.to_string(),
    })
}

/// Spawns the compressed-restore pipeline: the decompressor's stdout feeds
/// the copy tool's stdin. The pipeline's effective exit status is the copy
/// tool's; the decompressor's stderr is still surveilled for diagnostics.
pub fn spawn_piped(
    producer: &Decompressor,
    program: &str,
    args: &[String],
    elevate: bool,
) -> Result<RunningProcess> {
    debug!(producer = producer.command, program, "spawning pipeline");
    let mut upstream = Command::new(producer.command)
        .args(&producer.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::Launch {
            command: producer.command.to_string(),
            source,
        })?;

    let feed = upstream.stdout.take().ok_or_else(|| Error::Launch {
        command: producer.command.to_string(),
        source: std::io::Error::other("decompressor produced no stdout handle"),
    })?;

    let mut cmd = build_command(program, args, elevate);
    let spawned = cmd
        .stdin(Stdio::from(feed))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(source) => {
            let _ = upstream.kill();
            let _ = upstream.wait();
            return Err(Error::Launch {
                command: program.to_string(),
                source,
            });
        }
    };

    let (tx, events) = mpsc::channel();
    if let Some(err) = upstream.stderr.take() {
        pump(err, Channel::Stderr, tx.clone());
    }
    if let Some(out) = child.stdout.take() {
        pump(out, Channel::Stdout, tx.clone());
    }
    if let Some(err) = child.stderr.take() {
        pump(err, Channel::Stderr, tx);
    }

    Ok(RunningProcess {
        children: vec![upstream, child],
        events,
        command: program.to_string(),
    })
}

/// Runs a tool to completion with all streams inherited from the terminal.
/// Used for the privilege check, where sudo's own prompt must be visible.
pub fn run_interactive(program: &str, args: &[String]) -> Result<Option<i32>> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|source| Error::Launch {
            command: program.to_string(),
            source,
        })?;
    Ok(status.code())
}

impl RunningProcess {
    /// The program name this process was spawned as, for failure messages.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Terminates the whole subprocess tree. Only called after the user has
    /// confirmed a cancel.
    ///
    /// SIGTERM rather than `Child::kill`: an elevated child is a `sudo`
    /// wrapper around the real tool, and sudo relays SIGTERM to the
    /// root-owned command it runs but can never relay SIGKILL. A plain
    /// `Child::kill` would take down only the wrapper and leave `dd`
    /// writing to the destination media.
    pub fn kill(&mut self) {
        for child in &mut self.children {
            #[cfg(unix)]
            // Safety: the child has not been reaped yet, so the pid cannot
            // have been recycled.
            unsafe {
                libc::kill(child.id() as i32, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            let _ = child.kill();
        }
    }

    /// Reaps every child and returns the status-bearing exit code, `None`
    /// when the child was terminated by a signal.
    pub fn wait(mut self) -> std::io::Result<Option<i32>> {
        let mut code = None;
        let last = self.children.len() - 1;
        for (i, child) in self.children.iter_mut().enumerate() {
            let status = child.wait()?;
            if i == last {
                code = status.code();
            }
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn drain(proc: &RunningProcess) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = proc.events.recv_timeout(Duration::from_secs(5)) {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let proc = spawn("sh", &args(&["-c", "printf hello; exit 3"]), false).unwrap();
        let chunks = drain(&proc);
        let stdout: String = chunks
            .iter()
            .filter(|c| c.channel == Channel::Stdout)
            .map(|c| c.text.as_str())
            .collect();
        assert_eq!(stdout, "hello");
        assert_eq!(proc.wait().unwrap(), Some(3));
    }

    #[test]
    fn tags_stderr_chunks() {
        let proc = spawn("sh", &args(&["-c", "echo oops >&2"]), false).unwrap();
        let chunks = drain(&proc);
        assert!(chunks
            .iter()
            .any(|c| c.channel == Channel::Stderr && c.text.contains("oops")));
        assert_eq!(proc.wait().unwrap(), Some(0));
    }

    #[test]
    fn missing_binary_is_a_launch_failure() {
        let err = spawn("definitely-not-a-real-tool", &[], false).unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
    }

    #[test]
    fn kill_reaches_the_command_behind_the_wrapper() {
        // exec makes sleep replace the shell, so the recorded pid is the
        // long-running worker itself and the signal must land on it.
        let start = std::time::Instant::now();
        let mut proc = spawn("sh", &args(&["-c", "exec sleep 30"]), false).unwrap();
        proc.kill();
        drain(&proc);
        assert_eq!(proc.wait().unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn kill_stops_both_ends_of_a_pipeline() {
        let producer = Decompressor {
            command: "sh",
            args: args(&["-c", "sleep 30"]),
        };
        let start = std::time::Instant::now();
        let mut proc = spawn_piped(&producer, "sh", &args(&["-c", "sleep 30"]), false).unwrap();
        proc.kill();
        drain(&proc);
        assert_eq!(proc.wait().unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn pipeline_status_comes_from_the_consumer() {
        let producer = Decompressor {
            command: "sh",
            args: args(&["-c", "printf data"]),
        };
        let proc = spawn_piped(&producer, "sh", &args(&["-c", "cat >/dev/null; exit 7"]), false)
            .unwrap();
        drain(&proc);
        assert_eq!(proc.wait().unwrap(), Some(7));
    }
}
