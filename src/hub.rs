// ABOUTME: The broker process - accept loop, fan-in, router task, per-destination writers
// ABOUTME: Owns every piece of mutable state; workers only ever touch their own queue

use crate::codec::{self, FrameType, Reply};
use crate::config::{HubConfig, PipeConfig};
use crate::limit::TokenBucket;
use crate::router::{Emission, Router};
use crate::transport::fifo::{FifoSink, FifoTransport};
use crate::transport::stream::StreamTransport;
use crate::transport::{FrameSink, HandleId, Origin, TransportError, TransportEvent};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Which transport the hub should open.
pub enum Backend {
    /// Named pipes under `/tmp` (or a configured directory).
    Pipe(PipeConfig),
    /// TLS over TCP.
    Tls {
        addr: SocketAddr,
        cert: PathBuf,
        key: PathBuf,
    },
}

enum RunningBackend {
    Pipe(FifoTransport),
    Stream(StreamTransport),
}

impl RunningBackend {
    fn shutdown(self) {
        match self {
            RunningBackend::Pipe(transport) => transport.shutdown(),
            RunningBackend::Stream(transport) => transport.shutdown(),
        }
    }
}

/// A writer task reported its destination dead.
struct WriteFailed {
    handle: HandleId,
}

struct Writer {
    tx: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
    consecutive_drops: u32,
}

/// The hub: owns the router, the writer registry, and the fan-in channel.
///
/// Everything here runs on one task; writer tasks are the only other actors
/// and each of them owns exactly one queue and one sink, so no two workers
/// ever contend on shared state.
pub struct Hub {
    cfg: HubConfig,
    router: Router,
    writers: HashMap<HandleId, Writer>,
    draining: Vec<JoinHandle<()>>,
    buckets: HashMap<HandleId, TokenBucket>,
    /// Pipe endpoints are identified by name. Both maps live exactly as long
    /// as the handle's writer: released or never-registered endpoints are
    /// dropped, and a reconnect allocates a fresh handle.
    pipe_handles: HashMap<String, HandleId>,
    pipe_names: HashMap<HandleId, String>,
    /// Directory for per-client reply pipes (pipe backend only).
    client_dir: Option<PathBuf>,
    events_rx: mpsc::Receiver<TransportEvent>,
    feedback_tx: mpsc::Sender<WriteFailed>,
    feedback_rx: mpsc::Receiver<WriteFailed>,
}

impl Hub {
    /// Open the chosen backend and run the broker until `shutdown` flips.
    ///
    /// Returns only fatal failures: an inbound endpoint that cannot be
    /// opened, or unloadable credentials.
    pub async fn run(
        backend: Backend,
        cfg: HubConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let (events_tx, events_rx) = mpsc::channel(256);

        let (running, client_dir) = match backend {
            Backend::Pipe(pipe) => {
                let transport = FifoTransport::spawn(pipe.server_path.clone(), events_tx)?;
                (RunningBackend::Pipe(transport), Some(pipe.client_dir))
            }
            Backend::Tls { addr, cert, key } => {
                let tls = crate::transport::stream::load_server_config(&cert, &key)?;
                let transport = StreamTransport::bind(addr, tls, events_tx)?;
                (RunningBackend::Stream(transport), None)
            }
        };

        let (feedback_tx, feedback_rx) = mpsc::channel(256);
        let mut hub = Hub {
            router: Router::new(cfg.capacity, cfg.eviction.clone()),
            writers: HashMap::new(),
            draining: Vec::new(),
            buckets: HashMap::new(),
            pipe_handles: HashMap::new(),
            pipe_names: HashMap::new(),
            client_dir,
            events_rx,
            feedback_tx,
            feedback_rx,
            cfg,
        };

        hub.event_loop(shutdown).await;
        hub.finish(running).await;
        Ok(())
    }

    async fn event_loop(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.cfg.eviction.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request too.
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    let emissions = self.router.tick(Instant::now());
                    self.dispatch(emissions);
                }
                Some(failed) = self.feedback_rx.recv() => {
                    self.router.on_write_failure(failed.handle, Instant::now());
                    self.remove_writer(failed.handle);
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        // All backends gone; nothing more will arrive.
                        None => return,
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { handle, peer, sink } => {
                debug!(%handle, %peer, "endpoint attached");
                self.spawn_writer(handle, sink);
            }
            TransportEvent::Frame { origin, bytes } => {
                let now = Instant::now();
                let Some(handle) = self.resolve_origin(origin) else {
                    return;
                };

                let bucket = self
                    .buckets
                    .entry(handle)
                    .or_insert_with(|| TokenBucket::new(self.cfg.rate, now));
                if !bucket.allow(now) {
                    warn!(%handle, "rate limit exceeded, dropping frame");
                    return;
                }

                match codec::decode_request(&bytes) {
                    Ok(frame) => {
                        let emissions = self.router.step(handle, frame, now);
                        self.dispatch(emissions);
                    }
                    Err(err) => {
                        warn!(%handle, %err, "malformed frame");
                        let reply = Reply::system(FrameType::Error, "", err.to_string());
                        self.deliver(handle, reply);
                    }
                }
                self.prune_unregistered_pipe_endpoint(handle);
            }
            TransportEvent::Disconnected { handle } => {
                let emissions = self.router.on_disconnect(handle, Instant::now());
                self.dispatch(emissions);
                self.remove_writer(handle);
            }
        }
    }

    /// Map a transport origin to a delivery handle, allocating an identity
    /// and writer for a pipe endpoint not currently known (first contact, or
    /// first frame after its handle was released).
    fn resolve_origin(&mut self, origin: Origin) -> Option<HandleId> {
        match origin {
            Origin::Endpoint(handle) => Some(handle),
            Origin::Name(name) => {
                let dir = self.client_dir.clone()?;
                let handle = match self.pipe_handles.get(&name) {
                    Some(&handle) => handle,
                    None => {
                        let handle = HandleId::next();
                        self.pipe_handles.insert(name.clone(), handle);
                        self.pipe_names.insert(handle, name.clone());
                        handle
                    }
                };
                if !self.writers.contains_key(&handle) {
                    let sink = FrameSink::Fifo(FifoSink::new(&dir, &name));
                    self.spawn_writer(handle, sink);
                }
                Some(handle)
            }
        }
    }

    fn spawn_writer(&mut self, handle: HandleId, sink: FrameSink) {
        let (tx, rx) = mpsc::channel(self.cfg.queue_depth);
        let task = tokio::spawn(writer_task(
            handle,
            sink,
            rx,
            self.cfg.write_deadline,
            self.feedback_tx.clone(),
        ));
        if let Some(old) = self.writers.insert(
            handle,
            Writer {
                tx,
                task,
                consecutive_drops: 0,
            },
        ) {
            self.draining.push(old.task);
        }
    }

    fn dispatch(&mut self, emissions: Vec<Emission>) {
        for emission in emissions {
            match emission {
                Emission::Deliver { to, reply } => self.deliver(to, reply),
                Emission::Release(handle) => {
                    debug!(%handle, "releasing delivery handle");
                    self.remove_writer(handle);
                }
            }
        }
    }

    fn deliver(&mut self, to: HandleId, reply: Reply) {
        let bytes = match reply.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%to, %err, "unencodable reply dropped");
                return;
            }
        };

        // Writers and pipe identities are created and torn down together, so
        // a missing writer means the destination is already gone.
        let Some(writer) = self.writers.get_mut(&to) else {
            debug!(%to, "no writer for destination, dropping frame");
            return;
        };
        let failed = match writer.tx.try_send(bytes) {
            Ok(()) => {
                writer.consecutive_drops = 0;
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                writer.consecutive_drops += 1;
                warn!(
                    %to,
                    drops = writer.consecutive_drops,
                    "write queue full, dropping newest frame"
                );
                writer.consecutive_drops >= self.cfg.degraded_after
            }
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        };

        if failed {
            // Slow or dead consumer: isolate it instead of blocking the
            // router. The departure announcement rides the next step.
            self.router.on_write_failure(to, Instant::now());
            self.remove_writer(to);
        }
    }

    fn remove_writer(&mut self, handle: HandleId) {
        if let Some(writer) = self.writers.remove(&handle) {
            // Dropping the sender lets the task drain what is already
            // queued, close its sink, and exit.
            drop(writer.tx);
            self.draining.push(writer.task);
        }
        self.buckets.remove(&handle);
        // A pipe identity dies with its handle. A reconnect may already hold
        // the name under a fresh handle, which must survive.
        if let Some(name) = self.pipe_names.remove(&handle) {
            if self.pipe_handles.get(&name) == Some(&handle) {
                self.pipe_handles.remove(&name);
            }
        }
    }

    /// A pipe endpoint keeps its identity only while the roster knows the
    /// name. One that never registered (or whose entry is gone) is torn down
    /// after its frame is handled; any queued error reply still drains
    /// before the writer exits.
    fn prune_unregistered_pipe_endpoint(&mut self, handle: HandleId) {
        let unregistered = match self.pipe_names.get(&handle) {
            Some(name) => self.router.roster().lookup(name).is_none(),
            None => return,
        };
        if unregistered {
            self.remove_writer(handle);
        }
    }

    /// Orderly teardown: stop the inbound side, say goodbye, drain writers
    /// under a deadline, unlink transport artifacts.
    async fn finish(mut self, running: RunningBackend) {
        info!("hub shutting down");
        running.shutdown();

        let emissions = self.router.shutdown();
        self.dispatch(emissions);

        let mut tasks = self.draining;
        for (_, writer) in self.writers.drain() {
            drop(writer.tx);
            tasks.push(writer.task);
        }

        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.cfg.drain_deadline, drain)
            .await
            .is_err()
        {
            warn!("drain deadline exceeded, abandoning pending writes");
        }
        info!("hub stopped");
    }
}

/// One destination's writer: drain the queue, honor the per-frame deadline,
/// report the first failure, close the sink.
async fn writer_task(
    handle: HandleId,
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Bytes>,
    deadline: Duration,
    feedback: mpsc::Sender<WriteFailed>,
) {
    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(deadline, sink.send(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(%handle, %err, "delivery failed");
                let _ = feedback.send(WriteFailed { handle }).await;
                break;
            }
            Err(_) => {
                warn!(%handle, "delivery deadline exceeded");
                let _ = feedback.send(WriteFailed { handle }).await;
                break;
            }
        }
    }
    sink.close().await;
}
