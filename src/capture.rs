//! Capture workers bridging a child's output pipe to a hub and a mirror writer

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::hub::{Hub, Line};

const CHUNK_SIZE: usize = 4096;

/// Which output stream a worker serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits a byte stream on `\n`
///
/// Only the newline is stripped; a preceding `\r` stays in the line.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Line> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let mut line = std::mem::take(&mut self.pending);
            line.extend_from_slice(&rest[..pos]);
            lines.push(line);
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    /// The unterminated tail, if any.
    pub fn finish(&mut self) -> Option<Line> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Starts the worker thread for one output stream.
///
/// The worker closes `hub` when it ends, which happens when the pipe reaches
/// EOF or fails.
pub fn spawn_worker<R>(
    stream: Stream,
    pipe: R,
    mirror: Option<Box<dyn Write + Send>>,
    hub: Arc<Hub>,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("proctrl-{}", stream))
        .spawn(move || run_worker(stream, pipe, mirror, &hub))
}

fn run_worker<R: Read>(
    stream: Stream,
    mut pipe: R,
    mut mirror: Option<Box<dyn Write + Send>>,
    hub: &Hub,
) {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                if let Some(w) = mirror.as_mut() {
                    if let Err(e) = w.write_all(chunk) {
                        warn!("{} mirror write failed, no longer mirroring: {}", stream, e);
                        mirror = None;
                    }
                }
                for line in splitter.push(chunk) {
                    hub.send(line);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if let Some(rest) = splitter.finish() {
                    hub.send(rest);
                }
                hub.send(format!("broken {} pipe: {}", stream, e).into_bytes());
                break;
            }
        }
    }

    if let Some(rest) = splitter.finish() {
        hub.send(rest);
    }
    if let Some(w) = mirror.as_mut() {
        let _ = w.flush();
    }

    debug!("{} capture worker finished", stream);
    hub.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingReader {
        sent: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::Other, "gone"));
            }
            self.sent = true;
            let data = b"partial";
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
    }

    #[test]
    fn test_splitter_handles_split_lines() {
        let mut s = LineSplitter::new();
        assert!(s.push(b"hel").is_empty());
        assert_eq!(s.push(b"lo\nwor"), vec![b"hello".to_vec()]);
        assert_eq!(s.push(b"ld\n\n"), vec![b"world".to_vec(), Vec::new()]);
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn test_splitter_keeps_carriage_return() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push(b"dos\r\n"), vec![b"dos\r".to_vec()]);
    }

    #[test]
    fn test_splitter_flushes_tail() {
        let mut s = LineSplitter::new();
        s.push(b"a\nb");
        assert_eq!(s.finish(), Some(b"b".to_vec()));
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn test_worker_captures_and_mirrors() {
        let hub = Arc::new(Hub::new());
        let mirror = Shared::default();
        let input: &'static [u8] = b"one\ntwo\nthree";
        let handle = spawn_worker(
            Stream::Stdout,
            input,
            Some(Box::new(mirror.clone())),
            Arc::clone(&hub),
        )
        .unwrap();
        handle.join().unwrap();

        assert!(hub.is_closed());
        assert_eq!(
            hub.history(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert_eq!(mirror.0.lock().as_slice(), input);
    }

    #[test]
    fn test_worker_reports_broken_pipe() {
        let hub = Arc::new(Hub::new());
        let handle = spawn_worker(
            Stream::Stderr,
            FailingReader { sent: false },
            None,
            Arc::clone(&hub),
        )
        .unwrap();
        handle.join().unwrap();

        assert_eq!(
            hub.history(),
            vec![b"partial".to_vec(), b"broken stderr pipe: gone".to_vec()]
        );
    }
}
