//! Helpers for running the generator process with a timeout and bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Outcome of a streamed child process.
#[derive(Debug)]
pub struct StreamedOutput {
    pub status: ExitStatus,
    pub stderr: Vec<u8>,
    pub stderr_truncated: usize,
    /// Stdout bytes forwarded to the line callback.
    pub stdout_bytes: usize,
    pub timed_out: bool,
    /// Stdout exceeded the output limit and the child was killed.
    pub overflowed: bool,
}

impl StreamedOutput {
    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).trim().to_string();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]", self.stderr_truncated));
        }
        text
    }
}

/// Spawn `cmd` with all three standard streams piped.
pub fn spawn_piped(mut cmd: Command) -> std::io::Result<Child> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.spawn()
}

/// Feed `stdin` to `child` and forward its stdout line by line to `on_line`.
///
/// Lines keep their trailing newline. Stdout is read on a helper thread and
/// handed back to the calling thread, so `on_line` runs where the caller does.
/// The child is killed when `timeout` elapses or when stdout grows past
/// `output_limit_bytes`; the line that crosses the limit is not forwarded.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn stream_child(
    mut child: Child,
    stdin: &[u8],
    timeout: Duration,
    output_limit_bytes: usize,
    on_line: &mut dyn FnMut(&str),
) -> Result<StreamedOutput> {
    let deadline = Instant::now() + timeout;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let stdout_handle = thread::spawn(move || forward_lines(stdout, &tx));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(err) = child_stdin.write_all(stdin) {
            // The child may legitimately exit without reading its input.
            debug!(err = %err, "child closed stdin early");
        }
    }

    let mut stdout_bytes = 0usize;
    let mut timed_out = false;
    let mut overflowed = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(line) => {
                if stdout_bytes + line.len() > output_limit_bytes {
                    overflowed = true;
                    break;
                }
                stdout_bytes += line.len();
                on_line(&String::from_utf8_lossy(&line));
            }
            Err(RecvTimeoutError::Timeout) => {
                timed_out = true;
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(rx);

    let status = if timed_out || overflowed {
        warn!(timed_out, overflowed, stdout_bytes, "killing generator");
        kill_and_wait(&mut child)?
    } else {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match child.wait_timeout(remaining).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!("generator closed stdout but did not exit in time, killing");
                timed_out = true;
                kill_and_wait(&mut child)?
            }
        }
    };

    join_thread(stdout_handle).context("join stdout")??;
    let (stderr, stderr_truncated) = join_thread(stderr_handle).context("join stderr")??;

    debug!(exit_code = ?status.code(), timed_out, overflowed, stdout_bytes, "command finished");
    Ok(StreamedOutput {
        status,
        stderr,
        stderr_truncated,
        stdout_bytes,
        timed_out,
        overflowed,
    })
}

fn kill_and_wait(child: &mut Child) -> Result<ExitStatus> {
    if let Err(err) = child.kill() {
        // Already exited between the check and the kill.
        debug!(err = %err, "kill failed");
    }
    child.wait().context("wait command after kill")
}

fn join_thread<T>(handle: thread::JoinHandle<T>) -> Result<T> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))
}

/// Send every line of `reader` to `tx` until EOF or until the receiver is gone.
fn forward_lines<R: Read>(reader: R, tx: &mpsc::Sender<Vec<u8>>) -> Result<()> {
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 || tx.send(line).is_err() {
            return Ok(());
        }
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
