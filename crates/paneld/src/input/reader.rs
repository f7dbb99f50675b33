//! Raw key events from Linux `/dev/input/event*` sources.
//!
//! Every source gets its own task. Sources are opened non-blocking and
//! registered with the tokio reactor; stopping a reader signals its task,
//! which drops (and so closes) the stream even while a read is pending.

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::ReadBuf;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Size of one `struct input_event` on this platform
pub const RECORD_SIZE: usize = std::mem::size_of::<libc::input_event>();

const TIME_SIZE: usize = std::mem::size_of::<libc::timeval>();

const EV_KEY: u16 = 0x01;

const KEY_RELEASED: i32 = 0;
const KEY_PRESSED: i32 = 1;

/// A key transition from any input source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: u16,
    pub pressed: bool,
}

/// Decode one record, keeping only key down/up transitions.
///
/// Auto-repeat (value 2) and non-key events yield `None`.
pub fn decode(record: &[u8; RECORD_SIZE]) -> Option<KeyEvent> {
    let body = &record[TIME_SIZE..];
    let kind = u16::from_ne_bytes([body[0], body[1]]);
    let code = u16::from_ne_bytes([body[2], body[3]]);
    let value = i32::from_ne_bytes([body[4], body[5], body[6], body[7]]);

    if kind != EV_KEY {
        return None;
    }

    match value {
        KEY_PRESSED => Some(KeyEvent {
            code,
            pressed: true,
        }),
        KEY_RELEASED => Some(KeyEvent {
            code,
            pressed: false,
        }),
        _ => None,
    }
}

/// Non-blocking input source driven by the tokio reactor
struct DeviceStream {
    inner: AsyncFd<File>,
}

impl DeviceStream {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }
}

impl AsyncRead for DeviceStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Read records from `source` until it ends, errors, or `close` fires
async fn pump<R>(
    name: &str,
    mut source: R,
    mut close: oneshot::Receiver<()>,
    tx: mpsc::UnboundedSender<KeyEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut record = [0u8; RECORD_SIZE];

    loop {
        tokio::select! {
            _ = &mut close => {
                debug!("Reader for {} closed", name);
                break;
            }
            result = source.read_exact(&mut record) => {
                match result {
                    Ok(_) => {
                        if let Some(event) = decode(&record) {
                            debug!(
                                "Key event: code={}, pressed={} from {}",
                                event.code, event.pressed, name
                            );
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Error reading from {}: {}", name, e);
                        break;
                    }
                }
            }
        }
    }

    info!("Stopped reading from {}", name);
}

pub struct InputReader {
    device_dir: PathBuf,
    running: AtomicBool,
    /// Close signal for every open source
    streams: Mutex<HashMap<PathBuf, oneshot::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InputReader {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
            running: AtomicBool::new(false),
            streams: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one reader per readable `event*` source, returning how many started
    pub fn start(&self, tx: mpsc::UnboundedSender<KeyEvent>) -> usize {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Input reader already running");
            return 0;
        }

        info!("Starting input readers in {}", self.device_dir.display());

        let entries = match std::fs::read_dir(&self.device_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    "Input directory {} unavailable: {}",
                    self.device_dir.display(),
                    e
                );
                return 0;
            }
        };

        let mut sources: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("event"))
            .map(|e| e.path())
            .collect();
        sources.sort();

        if sources.is_empty() {
            error!("No input event sources found");
            return 0;
        }

        let mut started = 0;
        for path in sources {
            let stream = match DeviceStream::open(&path) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot read {}: {}", path.display(), e);
                    continue;
                }
            };

            let (close_tx, close_rx) = oneshot::channel();
            lock(&self.streams).insert(path.clone(), close_tx);

            info!("Starting reader for {}", path.display());
            let name = path.display().to_string();
            let tx = tx.clone();
            let task = tokio::spawn(async move {
                pump(&name, stream, close_rx, tx).await;
            });
            lock(&self.tasks).push(task);
            started += 1;
        }

        started
    }

    /// Close every source and wait for the readers to finish.
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping input readers");
        for (_, close) in lock(&self.streams).drain() {
            let _ = close.send(());
        }

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Input reader task failed: {}", e);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
