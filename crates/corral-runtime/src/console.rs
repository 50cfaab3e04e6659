//! Process consoles: a pseudo-terminal or three plain pipes between the
//! caller's streams and a container process.
//!
//! Setup hands back the child-side descriptors as a [`ProcessIo`] for the
//! backend to install as stdio, and a [`Terminal`] the driver keeps for
//! resizing and teardown. Copy threads move bytes between the caller's
//! [`Pipes`] and the driver-side ends.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::pty::{OpenptyResult, Winsize, openpty};

/// How long closing a console waits for its output copies to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Window size of a fresh terminal until the first resize.
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Destination of process output.
pub trait OutputSink: Write + Send {
    /// Called once the process side of the stream is closed and every byte
    /// has been written.
    fn close_writer(&mut self) {}
}

/// An [`OutputSink`] over any writer, with nothing to close.
#[derive(Debug)]
pub struct StreamSink<W>(pub W);

impl<W: Write> Write for StreamSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> OutputSink for StreamSink<W> {}

#[derive(Debug, Default)]
struct BufferState {
    data: Vec<u8>,
    closed: bool,
}

/// In-memory sink that records output and whether the stream was closed.
///
/// Clones share the same buffer, so a caller can keep one clone and hand
/// the other to the driver.
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    inner: Arc<(Mutex<BufferState>, Condvar)>,
}

impl BufferSink {
    /// Creates an empty, open buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.state().data.clone()
    }

    /// Bytes written so far, decoded lossily.
    #[must_use]
    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.state().data).into_owned()
    }

    /// Whether the writer side has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Blocks until the writer side is closed or `timeout` elapses.
    /// Returns whether the buffer is closed.
    #[must_use]
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |state| !state.closed)
            .unwrap_or_else(PoisonError::into_inner);
        guard.closed
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for BufferSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state().data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputSink for BufferSink {
    fn close_writer(&mut self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        cvar.notify_all();
    }
}

/// The caller's side of a process's standard streams.
pub struct Pipes {
    /// Input forwarded to the process; `None` connects `/dev/null`.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Receives standard output, and everything when a tty is attached.
    pub stdout: Box<dyn OutputSink>,
    /// Receives standard error; unused when a tty is attached.
    pub stderr: Box<dyn OutputSink>,
}

impl Pipes {
    /// Bundles the three streams.
    #[must_use]
    pub fn new(
        stdin: Option<Box<dyn Read + Send>>,
        stdout: Box<dyn OutputSink>,
        stderr: Box<dyn OutputSink>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }

    /// No input; output is discarded.
    #[must_use]
    pub fn null() -> Self {
        Self::new(
            None,
            Box::new(StreamSink(io::sink())),
            Box::new(StreamSink(io::sink())),
        )
    }
}

impl std::fmt::Debug for Pipes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipes")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Child-side descriptors to install as a process's stdio.
#[derive(Debug)]
pub struct ProcessIo {
    /// Descriptor for fd 0.
    pub stdin: OwnedFd,
    /// Descriptor for fd 1.
    pub stdout: OwnedFd,
    /// Descriptor for fd 2.
    pub stderr: OwnedFd,
    /// Whether the descriptors are a terminal the process should make its
    /// controlling terminal.
    pub tty: bool,
}

impl ProcessIo {
    /// Converts the descriptors into `(stdin, stdout, stderr)`.
    #[must_use]
    pub fn into_stdio(self) -> (Stdio, Stdio, Stdio) {
        (
            Stdio::from(self.stdin),
            Stdio::from(self.stdout),
            Stdio::from(self.stderr),
        )
    }
}

/// Driver-held end of a process console.
pub trait Terminal: Send + Sync {
    /// Sets the window size. Consoles without a terminal ignore it.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal is closed or the ioctl fails.
    fn resize(&self, rows: u16, cols: u16) -> io::Result<()>;

    /// Releases the driver-held descriptors and waits briefly for pending
    /// output to reach the sinks. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if releasing a descriptor fails.
    fn close(&self) -> io::Result<()>;
}

/// Creates the console for one process.
///
/// With `tty` a pseudo-terminal is allocated and its slave is owned by
/// `root_uid`, the host uid of the container's root user. Otherwise the
/// process gets three pipes.
///
/// # Errors
///
/// Returns an error if descriptors or copy threads cannot be created.
pub fn setup(tty: bool, pipes: Pipes, root_uid: u32) -> io::Result<(Arc<dyn Terminal>, ProcessIo)> {
    if tty {
        let (console, io) = TtyConsole::open(pipes, root_uid)?;
        Ok((Arc::new(console), io))
    } else {
        let (console, io) = StdConsole::open(pipes)?;
        Ok((Arc::new(console), io))
    }
}

/// Driver-side write end of a process's input, shared with its copy thread
/// so that closing the console releases it even while the caller's input is
/// still open.
type InputEnd = Arc<Mutex<Option<File>>>;

/// Tracks the output copy threads of a console.
#[derive(Debug)]
struct Drain {
    done: Receiver<()>,
    pending: usize,
}

impl Drain {
    fn wait(self) {
        for _ in 0..self.pending {
            if self.done.recv_timeout(DRAIN_TIMEOUT).is_err() {
                tracing::debug!("console output still open after close");
                return;
            }
        }
    }
}

/// Pseudo-terminal console.
#[derive(Debug)]
pub struct TtyConsole {
    master: Mutex<Option<OwnedFd>>,
    input: Option<InputEnd>,
    drain: Mutex<Option<Drain>>,
}

impl TtyConsole {
    fn open(pipes: Pipes, root_uid: u32) -> io::Result<(Self, ProcessIo)> {
        let winsize = Winsize {
            ws_row: DEFAULT_ROWS,
            ws_col: DEFAULT_COLS,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } =
            openpty(Some(&winsize), None).map_err(io::Error::from)?;
        set_cloexec(&master)?;
        set_cloexec(&slave)?;
        if nix::unistd::geteuid().as_raw() != root_uid {
            std::os::unix::fs::fchown(&slave, Some(root_uid), Some(root_uid))?;
        }

        let Pipes {
            stdin,
            stdout,
            mut stderr,
        } = pipes;
        // A terminal merges both output streams into stdout.
        stderr.close_writer();

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        spawn_output("tty-out", File::from(master.try_clone()?), stdout, done_tx)?;
        let input = match stdin {
            Some(stdin) => Some(spawn_input("tty-in", stdin, File::from(master.try_clone()?))?),
            None => None,
        };

        let io = ProcessIo {
            stdin: slave.try_clone()?,
            stdout: slave.try_clone()?,
            stderr: slave,
            tty: true,
        };
        tracing::debug!(master = master.as_raw_fd(), "pseudo-terminal allocated");
        Ok((
            Self {
                master: Mutex::new(Some(master)),
                input,
                drain: Mutex::new(Some(Drain {
                    done: done_rx,
                    pending: 1,
                })),
            },
            io,
        ))
    }
}

impl Terminal for TtyConsole {
    #[allow(unsafe_code)]
    fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(master) = master.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "console closed"));
        };
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: the descriptor is open for the guard's lifetime and
        // TIOCSWINSZ only reads the winsize struct.
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &raw const winsize) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        tracing::debug!(rows, cols, "console resized");
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        drop(self.master.lock().unwrap_or_else(PoisonError::into_inner).take());
        close_input(self.input.as_ref());
        let drain = self.drain.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(drain) = drain {
            drain.wait();
        }
        Ok(())
    }
}

/// Plain pipe console.
#[derive(Debug)]
pub struct StdConsole {
    input: Option<InputEnd>,
    drain: Mutex<Option<Drain>>,
    closed: AtomicBool,
}

impl StdConsole {
    fn open(pipes: Pipes) -> io::Result<(Self, ProcessIo)> {
        let Pipes {
            stdin,
            stdout,
            stderr,
        } = pipes;

        let (child_stdin, input) = match stdin {
            Some(source) => {
                let (read, write) = cloexec_pipe()?;
                (read, Some(spawn_input("stdin", source, File::from(write))?))
            }
            None => (OwnedFd::from(File::open("/dev/null")?), None),
        };

        let (done_tx, done_rx) = crossbeam_channel::bounded(2);
        let (out_read, out_write) = cloexec_pipe()?;
        spawn_output("stdout", File::from(out_read), stdout, done_tx.clone())?;
        let (err_read, err_write) = cloexec_pipe()?;
        spawn_output("stderr", File::from(err_read), stderr, done_tx)?;

        Ok((
            Self {
                input,
                drain: Mutex::new(Some(Drain {
                    done: done_rx,
                    pending: 2,
                })),
                closed: AtomicBool::new(false),
            },
            ProcessIo {
                stdin: child_stdin,
                stdout: out_write,
                stderr: err_write,
                tty: false,
            },
        ))
    }
}

impl Terminal for StdConsole {
    fn resize(&self, _rows: u16, _cols: u16) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        close_input(self.input.as_ref());
        let drain = self.drain.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(drain) = drain {
            drain.wait();
        }
        Ok(())
    }
}

fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    Ok(())
}

fn lock_input(input: &Mutex<Option<File>>) -> std::sync::MutexGuard<'_, Option<File>> {
    input.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops the driver-side input descriptor; the copy thread stops at its next
/// read.
fn close_input(input: Option<&InputEnd>) {
    if let Some(input) = input {
        drop(lock_input(input).take());
    }
}

fn spawn_output(
    name: &str,
    mut source: File,
    mut sink: Box<dyn OutputSink>,
    done: Sender<()>,
) -> io::Result<()> {
    let _handle = std::thread::Builder::new()
        .name(format!("console-{name}"))
        .spawn(move || {
            match io::copy(&mut source, &mut sink) {
                Ok(_) => {}
                // The pty master reports EIO once every slave is closed.
                Err(e) if e.raw_os_error() == Some(libc::EIO) => {}
                Err(e) => tracing::debug!(error = %e, "console output copy failed"),
            }
            if let Err(e) = sink.flush() {
                tracing::debug!(error = %e, "console output flush failed");
            }
            sink.close_writer();
            drop(source);
            let _ = done.send(());
        })?;
    Ok(())
}

fn spawn_input(name: &str, mut source: Box<dyn Read + Send>, target: File) -> io::Result<InputEnd> {
    let target = Arc::new(Mutex::new(Some(target)));
    let shared = Arc::clone(&target);
    let _handle = std::thread::Builder::new()
        .name(format!("console-{name}"))
        .spawn(move || copy_input(source.as_mut(), &shared))?;
    Ok(target)
}

fn copy_input(source: &mut dyn Read, target: &Mutex<Option<File>>) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "console input read failed");
                break;
            }
        };
        let mut guard = lock_input(target);
        let Some(file) = guard.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(&buf[..n]) {
            tracing::debug!(error = %e, "console input write failed");
            break;
        }
    }
    // End of input closes the process's stdin.
    drop(lock_input(target).take());
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    fn own_uid() -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    #[test]
    fn buffer_sink_clones_share_state() {
        let sink = BufferSink::new();
        let mut writer = sink.clone();
        writer.write_all(b"hello").unwrap();
        assert_eq!(sink.contents_lossy(), "hello");
        assert!(!sink.is_closed());
        writer.close_writer();
        assert!(sink.wait_closed(Duration::from_millis(10)));
    }

    #[test]
    fn std_console_routes_streams_separately() {
        let out = BufferSink::new();
        let err = BufferSink::new();
        let pipes = Pipes::new(
            Some(Box::new(io::Cursor::new(b"ping".to_vec()))),
            Box::new(out.clone()),
            Box::new(err.clone()),
        );
        let (console, io) = setup(false, pipes, own_uid()).unwrap();
        assert!(!io.tty);

        let (stdin, stdout, stderr) = io.into_stdio();
        let status = Command::new("sh")
            .args(["-c", "cat; echo oops >&2"])
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .unwrap();
        assert!(status.success());

        console.close().unwrap();
        assert!(out.wait_closed(Duration::from_secs(5)));
        assert!(err.wait_closed(Duration::from_secs(5)));
        assert_eq!(out.contents_lossy(), "ping");
        assert_eq!(err.contents_lossy(), "oops\n");

        console.close().unwrap();
        console.resize(24, 80).unwrap();
    }

    #[test]
    fn tty_console_resizes_the_terminal() {
        let out = BufferSink::new();
        let pipes = Pipes::new(None, Box::new(out.clone()), Box::new(BufferSink::new()));
        let (console, io) = setup(true, pipes, own_uid()).unwrap();
        assert!(io.tty);

        console.resize(40, 132).unwrap();
        let mut size = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ writes into the provided struct.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::ioctl(io.stdout.as_raw_fd(), libc::TIOCGWINSZ, &raw mut size) };
        assert_eq!(rc, 0);
        assert_eq!((size.ws_row, size.ws_col), (40, 132));

        drop(io);
        console.close().unwrap();
        assert!(out.wait_closed(Duration::from_secs(5)));
        assert!(console.resize(10, 10).is_err());
        console.close().unwrap();
    }

    /// Caller input that never ends while the sender is alive.
    struct OpenInput(crossbeam_channel::Receiver<Vec<u8>>);

    impl Read for OpenInput {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Ok(chunk) = self.0.recv() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    #[test]
    fn tty_close_releases_terminal_while_input_is_open() {
        let (_keep_open, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let pipes = Pipes::new(
            Some(Box::new(OpenInput(rx))),
            Box::new(BufferSink::new()),
            Box::new(BufferSink::new()),
        );
        let (console, io) = setup(true, pipes, own_uid()).unwrap();
        let slave = std::fs::read_link(format!("/proc/self/fd/{}", io.stdout.as_raw_fd())).unwrap();
        assert!(slave.exists());

        drop(io);
        console.close().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while slave.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!slave.exists(), "{} still allocated", slave.display());
    }

    #[test]
    fn std_close_ends_process_stdin_while_input_is_open() {
        let (_keep_open, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let pipes = Pipes::new(
            Some(Box::new(OpenInput(rx))),
            Box::new(BufferSink::new()),
            Box::new(BufferSink::new()),
        );
        let (console, io) = setup(false, pipes, own_uid()).unwrap();
        let mut child_stdin = File::from(io.stdin);
        drop((io.stdout, io.stderr));

        console.close().unwrap();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let _reader = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            let _ = done_tx.send(child_stdin.read(&mut buf).map_err(|e| e.kind()));
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(0));
    }

    #[test]
    fn tty_output_reaches_stdout_sink() {
        let out = BufferSink::new();
        let pipes = Pipes::new(None, Box::new(out.clone()), Box::new(BufferSink::new()));
        let (console, io) = setup(true, pipes, own_uid()).unwrap();

        let (stdin, stdout, stderr) = io.into_stdio();
        let status = Command::new("sh")
            .args(["-c", "echo tty-out"])
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .unwrap();
        assert!(status.success());

        console.close().unwrap();
        assert!(out.wait_closed(Duration::from_secs(5)));
        assert!(out.contents_lossy().contains("tty-out"));
    }
}
