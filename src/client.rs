//! Pipelined client over a single RESP connection.
//!
//! The client accepts commands from many tasks at once and pipelines them
//! over one ordered connection. Because RESP guarantees in-order responses,
//! no request identifier is needed: each issued command appends a one-shot
//! responder to a FIFO queue, and a background task decodes one frame at a
//! time and resolves the oldest pending request with it.
//!
//! Connection lifecycle is a three-state machine, `Open -> Closing ->
//! Closed`. A graceful close sends a terminating `QUIT` and waits for the
//! background task to drain the queue; a forced close resolves every
//! pending request with a failure before releasing the transport; any
//! protocol or I/O fault aborts the connection, broadcasting the fault to
//! every pending request.

use crate::connection::{self, FrameReader, FrameWriter};
use crate::frame::{self, Arg, Frame};
use crate::close_signal::CloseSignal;
use crate::Error;

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error};

/// Wire form of the terminating command sent by a graceful close.
const QUIT_COMMAND: &[u8] = b"*1\r\n$4\r\nQUIT\r\n";

/// Configuration for establishing a client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on how long the TCP connect may take.
    pub connect_timeout: Duration,

    /// Bound on array nesting while decoding responses.
    pub max_frame_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(5),
            max_frame_depth: connection::DEFAULT_MAX_FRAME_DEPTH,
        }
    }
}

/// Resolves one in-flight command, exactly once.
type Responder = oneshot::Sender<crate::Result<Frame>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Commands are accepted.
    Open,
    /// A graceful close is draining the pending queue; new commands are
    /// rejected.
    Closing,
    /// Every pending request has been resolved and the transport released.
    Closed,
}

/// The pending-request queue and lifecycle state, guarded as one unit.
#[derive(Debug)]
struct Pending {
    queue: VecDeque<Responder>,
    state: State,
}

/// State shared between the client handle and the background reader task.
#[derive(Debug)]
struct Shared {
    /// Write half of the transport. `None` once the transport is released.
    ///
    /// The async lock also serves as the ordering critical section: a
    /// command's placeholder is enqueued and its bytes written while this
    /// lock is held, so transport order matches queue order.
    writer: tokio::sync::Mutex<Option<FrameWriter<OwnedWriteHalf>>>,

    /// Pending responders plus the lifecycle state.
    pending: Mutex<Pending>,

    /// Announces close to the background reader.
    close_tx: broadcast::Sender<()>,

    /// Handle of the background reader, taken by whichever close waits on it.
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

/// A pipelined RESP client over a single TCP connection.
///
/// Methods take `&self`; wrap the client in an `Arc` to issue commands from
/// multiple tasks. Requests suspend only on their own response, never on
/// other pending requests, and there is no per-request cancellation or
/// timeout at this layer: once issued, a command resolves with a value, a
/// server error, or a closed/aborted-connection error.
#[derive(Debug)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Establishes a connection with the default configuration, bounded by
    /// `timeout`.
    pub async fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> crate::Result<Client> {
        let config = ClientConfig {
            connect_timeout: timeout,
            ..ClientConfig::default()
        };
        Client::connect_with_config(addr, config).await
    }

    /// Establishes a connection with an explicit configuration.
    pub async fn connect_with_config<A: ToSocketAddrs>(
        addr: A,
        config: ClientConfig,
    ) -> crate::Result<Client> {
        let stream = time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Io(Arc::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            })??;

        let (read_half, write_half) = stream.into_split();
        let reader = FrameReader::with_max_depth(read_half, config.max_frame_depth);
        let writer = FrameWriter::new(write_half);

        let (close_tx, close_rx) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(Pending {
                queue: VecDeque::new(),
                state: State::Open,
            }),
            close_tx,
            reader_task: Mutex::new(None),
        });

        let handle = tokio::spawn(read_responses(
            reader,
            Arc::clone(&shared),
            CloseSignal::new(close_rx),
        ));
        *shared.reader_task.lock().unwrap() = Some(handle);

        debug!("connection established");

        Ok(Client { shared })
    }

    /// Issues a command and suspends until its matching response arrives.
    ///
    /// Many tasks may call this concurrently; each caller waits only on its
    /// own response. The placeholder is appended to the pending queue and
    /// the bytes are written while the same write-side lock is held, which
    /// keeps transport order identical to queue order and preserves the
    /// FIFO matching invariant.
    ///
    /// A server error frame resolves this command alone; the connection
    /// stays open for others. Connection-level faults resolve this and
    /// every other pending command with the same error.
    pub async fn send_command(&self, args: &[Arg]) -> crate::Result<Frame> {
        // Encoding is all-or-nothing and happens before any network effect.
        let bytes = frame::encode_command(args)?;

        let mut writer = self.shared.writer.lock().await;
        let conn = writer.as_mut().ok_or(Error::Closed)?;

        let rx = {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.state != State::Open {
                return Err(Error::Closed);
            }
            let (tx, rx) = oneshot::channel();
            pending.queue.push_back(tx);
            rx
        };

        if let Err(err) = conn.write(&bytes).await {
            drop(writer);
            // A write failure is connection-fatal. Aborting also resolves
            // the placeholder pushed above.
            self.shared.abort(err.clone()).await;
            return Err(err);
        }
        drop(writer);

        match rx.await {
            Ok(outcome) => outcome,
            // The responder can only disappear unresolved if the connection
            // state was torn down.
            Err(_) => Err(Error::Closed),
        }
    }

    /// Closes the connection. Idempotent.
    ///
    /// With `force` unset, sends the terminating command and waits for the
    /// background reader to drain the pending queue before releasing the
    /// transport. With `force` set, resolves every pending request with
    /// [`Error::ForciblyClosed`] before this call returns, then releases
    /// the transport without waiting for in-flight responses.
    pub async fn close(&self, force: bool) {
        if force {
            self.close_forced().await;
        } else {
            self.close_graceful().await;
        }
    }

    async fn close_graceful(&self) {
        {
            let mut writer = self.shared.writer.lock().await;

            let send_quit = {
                let mut pending = self.shared.pending.lock().unwrap();
                match pending.state {
                    State::Closed => return,
                    // Another close is already draining; fall through and
                    // wait alongside it.
                    State::Closing => false,
                    State::Open => {
                        pending.state = State::Closing;
                        // The QUIT reply gets its own placeholder so the
                        // queue only drains once every response, including
                        // QUIT's, has been matched.
                        let (tx, _rx) = oneshot::channel();
                        pending.queue.push_back(tx);
                        true
                    }
                }
            };

            if send_quit {
                if let Some(conn) = writer.as_mut() {
                    if let Err(err) = conn.write(QUIT_COMMAND).await {
                        drop(writer);
                        self.shared.abort(err).await;
                        return;
                    }
                }
            }
        }

        // Wait for the response reader to finish draining the queue. It
        // exits on its own once the last pending response is matched.
        let handle = self.shared.reader_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.shared.release_transport().await;
        self.shared.pending.lock().unwrap().state = State::Closed;

        debug!("connection closed");
    }

    async fn close_forced(&self) {
        let responders = {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.state == State::Closed {
                return;
            }
            pending.state = State::Closed;
            std::mem::take(&mut pending.queue)
        };

        // Every pending request is resolved before the first await point,
        // so no caller stays suspended even if this task is never polled
        // again.
        for tx in responders {
            let _ = tx.send(Err(Error::ForciblyClosed));
        }

        let _ = self.shared.close_tx.send(());

        let handle = self.shared.reader_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.shared.release_transport().await;

        debug!("connection forcibly closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Stop the background reader; without this it would linger until
        // the server closes the stream.
        let _ = self.shared.close_tx.send(());
    }
}

impl Shared {
    /// Transitions to `Closed` and fails every pending request with `err`.
    async fn abort(&self, err: Error) {
        let responders = {
            let mut pending = self.pending.lock().unwrap();
            pending.state = State::Closed;
            std::mem::take(&mut pending.queue)
        };

        for tx in responders {
            let _ = tx.send(Err(err.clone()));
        }

        // Stop the reader if the abort came from elsewhere; harmless when
        // the reader itself is aborting.
        let _ = self.close_tx.send(());

        self.release_transport().await;
    }

    /// Releases the write side of the transport, best-effort.
    async fn release_transport(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut conn) = writer.take() {
            conn.shutdown().await;
        }
    }
}

/// Background task: reads responses for the life of the connection.
///
/// This is the only entity that removes items from the pending queue or
/// reads from the transport. It exits on the close signal, on a drained
/// queue while closing, or on a fatal error after broadcasting it.
async fn read_responses(
    mut reader: FrameReader<OwnedReadHalf>,
    shared: Arc<Shared>,
    mut close: CloseSignal,
) {
    loop {
        let result = tokio::select! {
            res = reader.read_frame() => res,
            _ = close.recv() => {
                debug!("response reader stopping on close signal");
                return;
            }
        };

        let frame = match result {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "fatal connection error");
                shared.abort(err).await;
                return;
            }
        };

        debug!(?frame, "response received");

        // A server error frame answers the specific command that caused
        // it; it is not a connection-level fault.
        let outcome = match frame {
            Frame::Error { kind, message } => Err(Error::Server { kind, message }),
            frame => Ok(frame),
        };

        let (responder, state, drained) = {
            let mut pending = shared.pending.lock().unwrap();
            let responder = pending.queue.pop_front();
            // A racing second closer may have advanced Closing to Closed
            // already; an empty queue in either state means the drain is
            // done and this task must exit.
            let drained = pending.queue.is_empty() && pending.state != State::Open;
            (responder, pending.state, drained)
        };

        match responder {
            Some(tx) => {
                // The receiver may already be gone (the graceful-close
                // placeholder drops its end); the response still counts as
                // delivered.
                let _ = tx.send(outcome);
            }
            // A frame racing a forced close can find the queue already
            // drained; the connection is gone either way.
            None if state == State::Closed => return,
            None => {
                error!("response received with no pending request");
                shared.abort(Error::ProtocolViolation).await;
                return;
            }
        }

        if drained {
            debug!("pending queue drained while closing");
            return;
        }
    }
}
