//! Raw frame dumps.
//!
//! Each captured frame is written to `<dir>/image_<N>.raw` as the bare
//! payload bytes, plane after plane, with no header.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes frames as headerless `.raw` files.
///
/// # Example
///
/// ```rust
/// use dmabuf_capture::sink::RawFrameSink;
///
/// let dir = tempfile::tempdir().unwrap();
/// let mut sink = RawFrameSink::new(dir.path()).unwrap();
/// let path = sink.write_frame(0, &[b"luma".as_slice(), b"chroma".as_slice()]).unwrap();
/// assert_eq!(std::fs::read(path).unwrap(), b"lumachroma");
/// ```
#[derive(Debug)]
pub struct RawFrameSink {
    dir: PathBuf,
    frames_written: u64,
    bytes_written: u64,
}

impl RawFrameSink {
    /// Create a sink writing into `dir`, which must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::Sink(format!(
                "output directory {} does not exist",
                dir.display()
            )));
        }
        Ok(Self {
            dir,
            frames_written: 0,
            bytes_written: 0,
        })
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path frame `n` is written to.
    pub fn path_for(&self, n: u64) -> PathBuf {
        self.dir.join(format!("image_{n}.raw"))
    }

    /// Write frame `n`, replacing any earlier file of the same name.
    pub fn write_frame(&mut self, n: u64, planes: &[&[u8]]) -> Result<PathBuf> {
        let path = self.path_for(n);
        let fail = |e: std::io::Error| Error::Sink(format!("{}: {}", path.display(), e));

        let mut writer = BufWriter::new(File::create(&path).map_err(fail)?);
        let mut len = 0usize;
        for plane in planes {
            writer.write_all(plane).map_err(fail)?;
            len += plane.len();
        }
        writer.flush().map_err(fail)?;

        self.frames_written += 1;
        self.bytes_written += len as u64;
        debug!(path = %path.display(), bytes = len, "Wrote frame");
        Ok(path)
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Payload bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
