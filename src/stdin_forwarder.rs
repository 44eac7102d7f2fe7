//! stdin forwarder - copies a caller reader into the child's stdin pipe
//!
//! The pipe is shared with `Process::send_input`, so both the forwarder and
//! the caller write through the same lock.
//!
//! The parent's own stdin outlives any single run, so it is read by one
//! process-wide [`StdinPump`] that forwards into whichever pipe is attached.

use std::io::{self, Read, Write};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, trace};

const CHUNK_SIZE: usize = 4096;

/// Write half of the child's stdin.
pub type PipeWriter = Box<dyn Write + Send>;

/// The child's stdin pipe. `None` once closed.
#[derive(Clone, Default)]
pub struct InputPipe {
    inner: Arc<Mutex<Option<PipeWriter>>>,
}

impl InputPipe {
    pub fn new(writer: PipeWriter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Writes all of `data`; fails with `BrokenPipe` once closed.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock();
        match guard.as_mut() {
            Some(w) => {
                w.write_all(data)?;
                w.flush()
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "input pipe is closed",
            )),
        }
    }

    /// Closes the pipe. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.inner.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

/// Background copier from a reader into an [`InputPipe`]
pub struct StdinForwarder;

impl StdinForwarder {
    /// Starts the copier thread.
    ///
    /// The thread ends when the reader hits EOF (closing the pipe), when the
    /// reader fails, or when the pipe has been closed by someone else.
    pub fn spawn(reader: Box<dyn Read + Send>, pipe: InputPipe) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("proctrl-stdin".into())
            .spawn(move || Self::copy_loop(reader, pipe))
    }

    fn copy_loop(mut reader: Box<dyn Read + Send>, pipe: InputPipe) {
        let mut buffer = [0u8; CHUNK_SIZE];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("stdin source reached EOF, closing input pipe");
                    pipe.close();
                    break;
                }
                Ok(n) => {
                    trace!("forwarding {} bytes to child stdin", n);
                    if let Err(e) = pipe.write_all(&buffer[..n]) {
                        debug!("child stdin no longer writable: {}", e);
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("stdin source read error: {}", e);
                    break;
                }
            }
        }
    }
}

static PARENT_STDIN: OnceLock<Mutex<Option<StdinPump>>> = OnceLock::new();

/// The pump reading the parent's stdin, started on first use.
pub fn parent_stdin() -> io::Result<StdinPump> {
    let mut slot = PARENT_STDIN.get_or_init(|| Mutex::new(None)).lock();
    if let Some(pump) = slot.as_ref() {
        return Ok(pump.clone());
    }
    let pump = StdinPump::spawn(Box::new(io::stdin()))?;
    *slot = Some(pump.clone());
    Ok(pump)
}

#[derive(Default)]
struct PumpState {
    target: Option<InputPipe>,
    /// Bytes read while no open pipe was attached.
    pending: Vec<u8>,
    eof: bool,
}

impl PumpState {
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let Some(target) = self.target.as_ref() else {
            return;
        };
        match target.write_all(&self.pending) {
            Ok(()) => self.pending.clear(),
            Err(e) => {
                debug!("attached input pipe gone ({}), holding {} bytes", e, self.pending.len());
                self.target = None;
            }
        }
    }
}

/// A long-lived reader forwarded into a replaceable [`InputPipe`]
///
/// Unlike [`StdinForwarder`], the reader is never tied to one run: bytes read
/// after a run's pipe closed are held for the next attached pipe.
#[derive(Clone)]
pub struct StdinPump {
    state: Arc<Mutex<PumpState>>,
}

impl StdinPump {
    pub fn spawn(reader: Box<dyn Read + Send>) -> io::Result<Self> {
        let state = Arc::new(Mutex::new(PumpState::default()));
        let shared = Arc::clone(&state);
        thread::Builder::new()
            .name("proctrl-stdin-pump".into())
            .spawn(move || Self::pump_loop(reader, shared))?;
        Ok(Self { state })
    }

    /// Makes `pipe` the destination, replacing the previous one.
    ///
    /// Held bytes are written first. If the reader already hit EOF the pipe
    /// is closed right away.
    pub fn attach(&self, pipe: InputPipe) {
        let mut state = self.state.lock();
        state.target = Some(pipe);
        state.flush();
        if state.eof && state.pending.is_empty() {
            if let Some(target) = state.target.take() {
                target.close();
            }
        }
    }

    fn pump_loop(mut reader: Box<dyn Read + Send>, state: Arc<Mutex<PumpState>>) {
        let mut buffer = [0u8; CHUNK_SIZE];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("pumped stdin reached EOF");
                    let mut state = state.lock();
                    state.eof = true;
                    state.flush();
                    if state.pending.is_empty() {
                        if let Some(target) = state.target.take() {
                            target.close();
                        }
                    }
                    break;
                }
                Ok(n) => {
                    trace!("pumping {} bytes", n);
                    let mut state = state.lock();
                    state.pending.extend_from_slice(&buffer[..n]);
                    state.flush();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("pumped stdin read error: {}", e);
                    state.lock().eof = true;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_forwarder_copies_and_closes() {
        let sink = Sink::default();
        let pipe = InputPipe::new(Box::new(sink.clone()));
        let handle =
            StdinForwarder::spawn(Box::new(io::Cursor::new(b"abc\n".to_vec())), pipe.clone())
                .unwrap();
        handle.join().unwrap();

        assert_eq!(sink.0.lock().as_slice(), b"abc\n");
        assert!(pipe.is_closed());
    }

    /// Blocks in `read` until the test hands it a chunk.
    struct ChannelReader(crossbeam_channel::Receiver<Vec<u8>>);

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Err(_) => Ok(0),
            }
        }
    }

    fn wait_for(sink: &Sink, expected: &[u8]) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while sink.0.lock().as_slice() != expected {
            assert!(
                std::time::Instant::now() < deadline,
                "sink holds {:?}",
                String::from_utf8_lossy(&sink.0.lock())
            );
            thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn test_pump_carries_input_across_runs() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pump = StdinPump::spawn(Box::new(ChannelReader(rx))).unwrap();

        let first = Sink::default();
        let first_pipe = InputPipe::new(Box::new(first.clone()));
        pump.attach(first_pipe.clone());
        tx.send(b"one\n".to_vec()).unwrap();
        wait_for(&first, b"one\n");

        // the first run ends while the reader is blocked
        first_pipe.close();
        tx.send(b"two\n".to_vec()).unwrap();

        let second = Sink::default();
        let second_pipe = InputPipe::new(Box::new(second.clone()));
        pump.attach(second_pipe.clone());
        wait_for(&second, b"two\n");
        assert_eq!(first.0.lock().as_slice(), b"one\n");

        drop(tx);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !second_pipe.is_closed() {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn test_pump_closes_pipes_attached_after_eof() {
        let pump = StdinPump::spawn(Box::new(io::empty())).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !pump.state.lock().eof {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(std::time::Duration::from_millis(10));
        }
        let pipe = InputPipe::new(Box::new(Sink::default()));
        pump.attach(pipe.clone());
        assert!(pipe.is_closed());
    }

    #[test]
    fn test_pipe_closes_once() {
        let pipe = InputPipe::new(Box::new(Sink::default()));
        assert!(pipe.close());
        assert!(!pipe.close());
        let err = pipe.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
