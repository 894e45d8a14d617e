//! Transcoding with an external `ffmpeg` process.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{TranscodeBackend, TranscodeError, TranscodeJob};

/// Lines of ffmpeg stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 5;

pub struct ExternalEncoder {
    program: String,
}

impl ExternalEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, job: &TranscodeJob) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y", "-i"]);
        cmd.arg(&job.input);
        cmd.args([
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "+faststart",
            "-an",
            "-f",
            "mp4",
        ]);
        cmd.arg(&job.output);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl TranscodeBackend for ExternalEncoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn attempt_transcode(&self, job: &TranscodeJob) -> Result<(), TranscodeError> {
        let mut child = self.command(job).spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                TranscodeError::Unavailable(format!("{} not found", self.program))
            }
            _ => TranscodeError::Io(e),
        })?;

        // Drain stderr so a chatty ffmpeg cannot block on a full pipe.
        let stderr_tail = child.stderr.take().and_then(|stderr| {
            std::thread::Builder::new()
                .name("ffmpeg-transcode-stderr".into())
                .spawn(move || {
                    let mut tail: Vec<String> = Vec::new();
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        if line.is_empty() {
                            continue;
                        }
                        debug!("[ffmpeg] {line}");
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                    tail.join("; ")
                })
                .ok()
        });

        let deadline = Instant::now() + job.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TranscodeError::TimedOut(job.timeout));
            }
            std::thread::sleep(Duration::from_millis(100));
        };

        let tail = stderr_tail
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(TranscodeError::Failed(format!(
                "{} exited with {status}: {tail}",
                self.program
            )));
        }
        Ok(())
    }
}
