//! Stream destinations for a child's stdin/stdout/stderr
//!
//! Each direction accepts one of: nothing (the child inherits, no capture),
//! the null sink (a real pipe is plumbed but nothing is forwarded), a caller
//! reader/writer, or the parent's own std stream.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::sync::OnceLock;

static DEV_NULL: OnceLock<NullDevice> = OnceLock::new();

#[cfg(unix)]
const NULL_PATH: &str = "/dev/null";
#[cfg(windows)]
const NULL_PATH: &str = "NUL";

struct NullDevice {
    file: Option<File>,
}

/// The null sink
///
/// Discards writes and reads as EOF. When passed to [`Process::start`]
/// it still causes a pipe to be created for the child.
///
/// [`Process::start`]: crate::Process::start
#[derive(Clone, Copy)]
pub struct DevNull {
    device: &'static NullDevice,
}

/// Returns the process-wide null sink.
pub fn dev_null() -> DevNull {
    let device = DEV_NULL.get_or_init(|| NullDevice {
        file: OpenOptions::new()
            .read(true)
            .write(true)
            .open(NULL_PATH)
            .ok(),
    });
    DevNull { device }
}

impl DevNull {
    /// Whether `self` and `other` are the same sentinel.
    pub fn is(&self, other: &DevNull) -> bool {
        std::ptr::eq(self.device, other.device)
    }

    /// The OS null device, for callers that need a real file.
    pub fn as_file(&self) -> Option<&'static File> {
        self.device.file.as_ref()
    }
}

impl Read for DevNull {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for DevNull {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for DevNull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DevNull")
    }
}

/// Where the child's stdin comes from
#[derive(Default)]
pub enum InputSource {
    /// Windows: the child uses the parent's console stdin. Unix: the child
    /// gets the null device. No input pipe either way.
    #[default]
    Inherit,
    /// A pipe the caller feeds through `send_input`.
    Null,
    /// A pipe fed by a background copier from this reader.
    Reader(Box<dyn Read + Send>),
    /// The parent's own stdin, copied into a pipe.
    Parent,
}

impl InputSource {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        InputSource::Reader(Box::new(reader))
    }

    /// The parent's stdin.
    pub fn stdin() -> Self {
        InputSource::Parent
    }

    pub(crate) fn has_pipe(&self) -> bool {
        !matches!(self, InputSource::Inherit)
    }
}

impl From<DevNull> for InputSource {
    fn from(_: DevNull) -> Self {
        InputSource::Null
    }
}

impl<R: Read + Send + 'static> From<Option<R>> for InputSource {
    fn from(reader: Option<R>) -> Self {
        match reader {
            Some(r) => InputSource::reader(r),
            None => InputSource::Inherit,
        }
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputSource::Inherit => "Inherit",
            InputSource::Null => "Null",
            InputSource::Reader(_) => "Reader",
            InputSource::Parent => "Parent",
        };
        f.write_str(name)
    }
}

/// Which of the parent's output streams an [`OutputSink::Parent`] mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentStream {
    Stdout,
    Stderr,
}

/// Where the child's stdout or stderr goes
#[derive(Default)]
pub enum OutputSink {
    /// The child writes straight to the parent's stream; nothing is captured.
    #[default]
    Inherit,
    /// Captured in memory only.
    Null,
    /// Captured and mirrored to this writer.
    Writer(Box<dyn Write + Send>),
    /// Captured and mirrored to the parent's own stream.
    Parent(ParentStream),
}

impl OutputSink {
    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        OutputSink::Writer(Box::new(writer))
    }

    pub fn stdout() -> Self {
        OutputSink::Parent(ParentStream::Stdout)
    }

    pub fn stderr() -> Self {
        OutputSink::Parent(ParentStream::Stderr)
    }

    pub(crate) fn is_captured(&self) -> bool {
        !matches!(self, OutputSink::Inherit)
    }

    #[cfg(windows)]
    pub(crate) fn is_parent(&self) -> bool {
        matches!(self, OutputSink::Parent(_))
    }

    /// The writer a capture worker mirrors into, if any.
    pub(crate) fn into_mirror(self) -> Option<Box<dyn Write + Send>> {
        match self {
            OutputSink::Inherit | OutputSink::Null => None,
            OutputSink::Writer(w) => Some(w),
            OutputSink::Parent(ParentStream::Stdout) => Some(Box::new(io::stdout())),
            OutputSink::Parent(ParentStream::Stderr) => Some(Box::new(io::stderr())),
        }
    }
}

impl From<DevNull> for OutputSink {
    fn from(_: DevNull) -> Self {
        OutputSink::Null
    }
}

impl<W: Write + Send + 'static> From<Option<W>> for OutputSink {
    fn from(writer: Option<W>) -> Self {
        match writer {
            Some(w) => OutputSink::writer(w),
            None => OutputSink::Inherit,
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSink::Inherit => f.write_str("Inherit"),
            OutputSink::Null => f.write_str("Null"),
            OutputSink::Writer(_) => f.write_str("Writer"),
            OutputSink::Parent(stream) => write!(f, "Parent({:?})", stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_null_identity_is_stable() {
        let a = dev_null();
        let b = dev_null();
        assert!(a.is(&b));
    }

    #[test]
    fn test_dev_null_discards_and_reads_eof() {
        let mut null = dev_null();
        assert_eq!(null.write(b"hello").unwrap(), 5);
        let mut buf = [0u8; 8];
        assert_eq!(null.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_dev_null_maps_to_null_variants() {
        assert!(matches!(OutputSink::from(dev_null()), OutputSink::Null));
        assert!(matches!(InputSource::from(dev_null()), InputSource::Null));
    }

    #[test]
    fn test_absent_sinks() {
        let out: OutputSink = None::<Vec<u8>>.into();
        assert!(!out.is_captured());
        let input: InputSource = None::<io::Empty>.into();
        assert!(!input.has_pipe());
    }

    #[test]
    fn test_mirror_selection() {
        assert!(OutputSink::Null.into_mirror().is_none());
        assert!(OutputSink::Inherit.into_mirror().is_none());
        assert!(OutputSink::writer(Vec::new()).into_mirror().is_some());
        assert!(matches!(
            OutputSink::stdout(),
            OutputSink::Parent(ParentStream::Stdout)
        ));
    }
}
