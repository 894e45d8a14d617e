//! Frame-by-frame JPEG decoding of a recording for the live-stream
//! fallback, using an `ffmpeg` child writing MJPEG to a pipe.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::debug;

use screenwatch_common::jpeg::JpegSplitter;

/// Yields complete JPEG images from any MJPEG byte stream.
pub struct FrameReader<R> {
    reader: R,
    splitter: JpegSplitter,
    ready: VecDeque<Bytes>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            splitter: JpegSplitter::default(),
            ready: VecDeque::new(),
            buf: vec![0; 64 * 1024],
        }
    }

    /// Next image, or `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.ready.extend(self.splitter.push(&self.buf[..n]));
        }
    }
}

/// One decoding pass over a recording.  Dropping it kills the child.
pub struct RecordingDecoder {
    _child: Child,
    frames: FrameReader<tokio::process::ChildStdout>,
}

impl RecordingDecoder {
    pub fn spawn(ffmpeg: &str, path: &Path) -> io::Result<Self> {
        let mut child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-an", "-f", "image2pipe", "-c:v", "mjpeg", "-q:v", "4", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("decoder stdout not captured"))?;
        debug!("Decoding {} for live fallback", path.display());

        Ok(Self {
            _child: child,
            frames: FrameReader::new(stdout),
        })
    }

    pub async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        self.frames.next_frame().await
    }
}
