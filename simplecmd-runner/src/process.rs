// Output capture for child processes. Stdout and stderr are drained on
// dedicated threads into one capture buffer and any live sinks.

use std::io::{self, PipeReader, Read, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A live consumer of child output
pub type Sink = Box<dyn Write + Send>;

const READ_CHUNK: usize = 8 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append-only buffer holding the combined output of a child.
///
/// Clones share the same storage, so a clone can also be handed to a runner
/// as a live sink.
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &[u8]) {
        lock(&self.bytes).extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current contents, with invalid UTF-8 replaced.
    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&lock(&self.bytes)).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One sink fed from both stream threads.
#[derive(Clone)]
struct SharedSink(Arc<Mutex<Sink>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        // Held across the whole chunk so the two streams never split each other's writes.
        lock(&self.0).write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.0).flush()
    }
}

/// Live sinks to attach to a run
#[derive(Default)]
pub struct LiveSinks {
    /// Receive stdout and stderr together.
    pub combined: Vec<Sink>,
    /// Receive stdout only.
    pub stdout: Vec<Sink>,
    /// Receive stderr only.
    pub stderr: Vec<Sink>,
}

impl LiveSinks {
    fn has_stream_sinks(&self) -> bool {
        !self.stdout.is_empty() || !self.stderr.is_empty()
    }
}

/// Duplicates every chunk into the capture buffer and then each sink, in order.
pub struct FanOut {
    buffer: CaptureBuffer,
    sinks: Vec<Sink>,
}

impl FanOut {
    pub fn new(buffer: CaptureBuffer, sinks: Vec<Sink>) -> Self {
        Self { buffer, sinks }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Sinks that fail are detached; the capture buffer always receives the chunk.
    pub fn write_chunk(&mut self, chunk: &[u8]) {
        self.buffer.append(chunk);
        self.sinks.retain_mut(|sink| {
            match sink.write_all(chunk).and_then(|_| sink.flush()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Live output sink failed, detaching it");
                    false
                }
            }
        });
    }
}

/// Read `reader` into `fan_out` on its own thread until end of file.
fn drain(
    name: &str,
    mut reader: PipeReader,
    mut fan_out: FanOut,
) -> io::Result<oneshot::Receiver<()>> {
    let (done_tx, done) = oneshot::channel();
    let stream = name.to_string();

    thread::Builder::new()
        .name(format!("simplecmd-{}", name))
        .spawn(move || {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => fan_out.write_chunk(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(stream = %stream, error = %e, "Reading child output failed");
                        break;
                    }
                }
            }
            debug!(stream = %stream, sinks = fan_out.sink_count(), "Output capture reached end of stream");
            // The receiver is gone when the runner already returned on timeout.
            let _ = done_tx.send(());
        })?;

    Ok(done)
}

/// Handle on the running capture threads of one child
pub struct OutputCapture {
    buffer: CaptureBuffer,
    pending: Vec<oneshot::Receiver<()>>,
}

impl OutputCapture {
    /// Start draining `reader` into `fan_out` until end of file.
    pub fn start(reader: PipeReader, fan_out: FanOut) -> io::Result<Self> {
        let buffer = fan_out.buffer.clone();
        let done = drain("capture", reader, fan_out)?;
        Ok(Self {
            buffer,
            pending: vec![done],
        })
    }

    /// Set up capture for `sinks` and return the child's stdout and stderr handles.
    ///
    /// Without per-stream sinks both streams share one pipe, so the buffer keeps
    /// their exact interleaving. Per-stream sinks need a pipe per stream; the
    /// buffer then interleaves chunks in the order the threads read them.
    pub fn open(sinks: LiveSinks) -> io::Result<(Self, Stdio, Stdio)> {
        if !sinks.has_stream_sinks() {
            let (reader, writer) = io::pipe()?;
            let stderr = writer.try_clone()?;
            let capture = Self::start(reader, FanOut::new(CaptureBuffer::new(), sinks.combined))?;
            return Ok((capture, Stdio::from(writer), Stdio::from(stderr)));
        }

        let LiveSinks {
            combined,
            mut stdout,
            mut stderr,
        } = sinks;
        for sink in combined {
            let shared = SharedSink(Arc::new(Mutex::new(sink)));
            stdout.push(Box::new(shared.clone()));
            stderr.push(Box::new(shared));
        }

        let buffer = CaptureBuffer::new();
        let (out_reader, out_writer) = io::pipe()?;
        let (err_reader, err_writer) = io::pipe()?;
        let pending = vec![
            drain("stdout", out_reader, FanOut::new(buffer.clone(), stdout))?,
            drain("stderr", err_reader, FanOut::new(buffer.clone(), stderr))?,
        ];

        Ok((
            Self { buffer, pending },
            Stdio::from(out_writer),
            Stdio::from(err_writer),
        ))
    }

    pub fn snapshot(&self) -> String {
        self.buffer.snapshot()
    }

    /// Wait until every stream reached end of file. Safe to cancel and call again.
    pub async fn closed(&mut self) {
        while let Some(done) = self.pending.first_mut() {
            let _ = done.await;
            self.pending.remove(0);
        }
    }

    /// Wait for end of stream and return everything captured.
    pub async fn finish(mut self) -> String {
        self.closed().await;
        self.buffer.snapshot()
    }

    /// Like `finish`, but gives up after `grace` and returns what is captured so far.
    pub async fn settle(mut self, grace: Duration) -> String {
        let _ = tokio::time::timeout(grace, self.closed()).await;
        self.buffer.snapshot()
    }
}
