//! Built-in network transmitter: fans frames out to every connected TCP client.
//!
//! `send_async` hands the lent frame to a worker thread that runs its own
//! Tokio runtime and returns without blocking. The worker copies the frame
//! into a packet (fixed header plus payload), drops the lease, and
//! broadcasts the packet. Clients that fall behind skip frames; nothing
//! waits for them.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytemuck::{Pod, Zeroable};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::error::{PumpError, Result};
use crate::frame::{fourcc, FrameDesc};
use crate::sink::sender::VideoSender;
use crate::stage::LentFrame;

/// First four bytes of every packet.
pub const PACKET_MAGIC: u32 = fourcc(b"FPMP");

/// Size of the fixed packet header in bytes.
pub const HEADER_LEN: usize = std::mem::size_of::<PacketHeader>();

/// Frames waiting for the worker. A second frame arriving while one is
/// still queued is dropped, which bounds how stale a lent buffer can get.
const QUEUE_DEPTH: usize = 1;

/// Packets buffered per client before it starts skipping.
const CLIENT_BACKLOG: usize = 4;

/// Little-endian packet header preceding each frame payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PacketHeader {
    pub magic: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub fourcc: u32,
    pub payload_len: u32,
    /// Capture timestamp in 100 ns units.
    pub timestamp_100ns: u64,
    pub sequence: u64,
}

impl PacketHeader {
    pub fn for_frame(desc: &FrameDesc, payload_len: usize) -> Self {
        Self {
            magic: PACKET_MAGIC.to_le(),
            width: desc.width.to_le(),
            height: desc.height.to_le(),
            stride: desc.stride_bytes.to_le(),
            frame_rate_num: desc.frame_rate.numerator.to_le(),
            frame_rate_den: desc.frame_rate.denominator.to_le(),
            fourcc: desc.pixel_format.fourcc().to_le(),
            payload_len: (payload_len as u32).to_le(),
            timestamp_100ns: ((desc.timestamp.as_nanos() / 100) as u64).to_le(),
            sequence: desc.sequence.to_le(),
        }
    }

    /// Parse a header from the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw: Self = bytemuck::pod_read_unaligned(bytes.get(..HEADER_LEN)?);
        let header = Self {
            magic: u32::from_le(raw.magic),
            width: u32::from_le(raw.width),
            height: u32::from_le(raw.height),
            stride: u32::from_le(raw.stride),
            frame_rate_num: u32::from_le(raw.frame_rate_num),
            frame_rate_den: u32::from_le(raw.frame_rate_den),
            fourcc: u32::from_le(raw.fourcc),
            payload_len: u32::from_le(raw.payload_len),
            timestamp_100ns: u64::from_le(raw.timestamp_100ns),
            sequence: u64::from_le(raw.sequence),
        };
        (header.magic == PACKET_MAGIC).then_some(header)
    }
}

/// Copy a lent frame into a self-contained packet.
fn encode_packet(frame: &LentFrame) -> Vec<u8> {
    // SAFETY: the worker reads the frame as soon as it is dequeued; with a
    // queue depth of one the pump has not yet come back around to this
    // parity.
    let payload = unsafe { frame.as_bytes() };
    let header = PacketHeader::for_frame(frame.desc(), payload.len());
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(bytemuck::bytes_of(&header));
    packet.extend_from_slice(payload);
    packet
}

#[derive(Debug, Default)]
struct FanoutCounters {
    clients: AtomicUsize,
    sent: AtomicU64,
    dropped: AtomicU64,
    lagged: AtomicU64,
}

/// TCP fan-out transmitter.
pub struct TcpFanoutSender {
    name: String,
    local_addr: SocketAddr,
    queue: Option<mpsc::Sender<Option<LentFrame>>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<FanoutCounters>,
}

impl TcpFanoutSender {
    /// Bind `bind` and start the worker thread.
    pub fn bind(name: &str, bind: &str) -> Result<Self> {
        let listener = StdTcpListener::bind(bind).map_err(|e| {
            PumpError::SinkConfigurationFailure(format!("cannot listen on {bind}: {e}"))
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| PumpError::SinkConfigurationFailure(format!("set_nonblocking: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PumpError::SinkConfigurationFailure(format!("local_addr: {e}")))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PumpError::SinkConfigurationFailure(format!("tokio runtime: {e}")))?;

        let (queue, frames) = mpsc::channel(QUEUE_DEPTH);
        let counters = Arc::new(FanoutCounters::default());
        let worker_counters = Arc::clone(&counters);

        let worker = std::thread::Builder::new()
            .name(format!("fanout-{name}"))
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => run_worker(listener, frames, worker_counters).await,
                        Err(e) => warn!("fan-out listener unusable: {e}"),
                    }
                });
            })
            .map_err(|e| PumpError::SinkConfigurationFailure(format!("spawn worker: {e}")))?;

        info!("'{name}' accepting receivers on {local_addr}");
        Ok(Self {
            name: name.to_string(),
            local_addr,
            queue: Some(queue),
            worker: Some(worker),
            counters,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receivers currently connected.
    pub fn client_count(&self) -> usize {
        self.counters.clients.load(Ordering::Acquire)
    }

    /// Packets handed to the broadcast channel.
    pub fn frames_sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Frames discarded because the worker was still busy.
    pub fn frames_dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Packets skipped by receivers that fell behind, summed over receivers.
    pub fn frames_lagged(&self) -> u64 {
        self.counters.lagged.load(Ordering::Relaxed)
    }
}

impl VideoSender for TcpFanoutSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_async(&mut self, frame: Option<LentFrame>) {
        let Some(queue) = &self.queue else {
            return;
        };
        match queue.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(Some(frame))) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("fan-out busy, dropping frame {}", frame.desc().sequence);
            }
            Err(TrySendError::Full(None)) => {}
            Err(TrySendError::Closed(_)) => debug!("fan-out worker has exited"),
        }
    }

    fn close(&mut self) {
        // Closing the queue ends the worker loop once it drains.
        self.queue = None;
        if let Some(worker) = self.worker.take() {
            debug!(
                "'{}' closing with {} receivers connected",
                self.name,
                self.client_count()
            );
            if worker.join().is_err() {
                warn!("fan-out worker panicked");
            }
            info!(
                "'{}' stopped: {} packets sent, {} dropped, {} skipped by slow receivers",
                self.name,
                self.frames_sent(),
                self.frames_dropped(),
                self.frames_lagged()
            );
        }
    }
}

impl Drop for TcpFanoutSender {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(
    listener: TcpListener,
    mut frames: mpsc::Receiver<Option<LentFrame>>,
    counters: Arc<FanoutCounters>,
) {
    let (packets, _) = broadcast::channel::<Arc<Vec<u8>>>(CLIENT_BACKLOG);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay for {peer}: {e}");
                    }
                    counters.clients.fetch_add(1, Ordering::AcqRel);
                    info!("receiver {peer} connected");
                    let receiver = packets.subscribe();
                    tokio::spawn(serve_client(stream, peer, receiver, Arc::clone(&counters)));
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            next = frames.recv() => match next {
                Some(Some(frame)) if packets.receiver_count() == 0 => drop(frame),
                Some(Some(frame)) => {
                    let packet = encode_packet(&frame);
                    drop(frame);
                    if packets.send(Arc::new(packet)).is_ok() {
                        counters.sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Some(None) => {}
                None => break,
            },
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut packets: broadcast::Receiver<Arc<Vec<u8>>>,
    counters: Arc<FanoutCounters>,
) {
    loop {
        match packets.recv().await {
            Ok(packet) => {
                if let Err(e) = stream.write_all(&packet).await {
                    debug!("receiver {peer} went away: {e}");
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                counters.lagged.fetch_add(skipped, Ordering::Relaxed);
                warn!("receiver {peer} lagging, skipped {skipped} frames");
            }
            Err(RecvError::Closed) => break,
        }
    }
    counters.clients.fetch_sub(1, Ordering::AcqRel);
    info!("receiver {peer} disconnected");
}
