use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nanobot_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::codec::BridgeCodec;
use crate::protocol::BridgeFrame;

#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    /// Frames buffered per direction before producers have to wait.
    pub queue_depth: usize,
    pub max_frame_bytes: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            max_frame_bytes: 256 * 1024,
        }
    }
}

/// Counters shared between the channel's reader and writer tasks.
#[derive(Debug, Default)]
pub struct ChannelStats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    malformed: AtomicU64,
}

impl ChannelStats {
    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    /// Frames dropped because they failed to decode or exceeded the size limit.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Count a frame that decoded but failed semantic validation.
    pub fn record_invalid(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Raised while either direction is waiting on a full queue.
#[derive(Debug)]
struct Pressure {
    inbound: AtomicBool,
    outbound: AtomicBool,
    tx: watch::Sender<bool>,
}

impl Pressure {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inbound: AtomicBool::new(false),
            outbound: AtomicBool::new(false),
            tx,
        }
    }

    fn set_inbound(&self, value: bool) {
        self.inbound.store(value, Ordering::SeqCst);
        self.publish();
    }

    fn set_outbound(&self, value: bool) {
        self.outbound.store(value, Ordering::SeqCst);
        self.publish();
    }

    fn publish(&self) {
        let raised = self.inbound.load(Ordering::SeqCst) || self.outbound.load(Ordering::SeqCst);
        self.tx.send_if_modified(|current| {
            if *current != raised {
                *current = raised;
                true
            } else {
                false
            }
        });
    }
}

/// Cloneable handle that queues frames for the bridge.
///
/// Lets a caller wait for room in the outbound queue without holding a borrow
/// of the [`BridgeChannel`] it came from.
#[derive(Clone)]
pub struct BridgeSender {
    label: Arc<str>,
    outgoing: mpsc::Sender<Bytes>,
    pressure: Arc<Pressure>,
    max_frame_bytes: usize,
}

impl BridgeSender {
    /// Serialize `frame`, rejecting it if it would exceed the frame limit.
    pub fn encode(&self, frame: &BridgeFrame) -> Result<Bytes> {
        let body = frame.to_bytes()?;
        if body.len() > self.max_frame_bytes {
            return Err(Error::Protocol(format!(
                "{} frame of {} bytes exceeds max size of {}",
                frame.kind(),
                body.len(),
                self.max_frame_bytes
            )));
        }
        Ok(body)
    }

    /// Queue an encoded frame without waiting.
    ///
    /// A full queue hands the body back and raises outbound pressure until a
    /// later [`reserve`](Self::reserve) gets through.
    pub fn try_send(&self, body: Bytes) -> std::result::Result<(), TrySendError<Bytes>> {
        let result = self.outgoing.try_send(body);
        if matches!(result, Err(TrySendError::Full(_))) {
            debug!(connector = %self.label, "outbound bridge queue full");
            self.pressure.set_outbound(true);
        }
        result
    }

    /// Wait for room in the outbound queue.
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, Bytes>> {
        let permit = self.outgoing.reserve().await;
        self.pressure.set_outbound(false);
        permit.map_err(|_| self.closed())
    }

    /// Queue a frame, waiting for room if the queue is full.
    pub async fn send(&self, frame: &BridgeFrame) -> Result<()> {
        let body = self.encode(frame)?;
        match self.try_send(body) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(body)) => {
                self.reserve().await?.send(body);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(self.closed()),
        }
    }

    pub fn closed(&self) -> Error {
        Error::Bridge(format!("channel to bridge '{}' is closed", self.label))
    }
}

/// Duplex, framed channel to one bridge process.
///
/// Both directions are bounded. A full queue makes the producer wait instead
/// of dropping frames, and raises the pressure flag so the supervisor can
/// report the connector as degraded.
pub struct BridgeChannel {
    sender: BridgeSender,
    incoming: mpsc::Receiver<BridgeFrame>,
    stats: Arc<ChannelStats>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl BridgeChannel {
    pub fn open<R, W>(label: impl Into<String>, reader: R, writer: W, limits: ChannelLimits) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label: String = label.into();
        let stats = Arc::new(ChannelStats::default());
        let pressure = Arc::new(Pressure::new());
        let (in_tx, in_rx) = mpsc::channel(limits.queue_depth);
        let (out_tx, out_rx) = mpsc::channel(limits.queue_depth);

        let reader = tokio::spawn(read_loop(
            label.clone(),
            FramedRead::new(reader, BridgeCodec::new(limits.max_frame_bytes)),
            in_tx,
            Arc::clone(&stats),
            Arc::clone(&pressure),
        ));
        let writer = tokio::spawn(write_loop(
            label.clone(),
            FramedWrite::new(writer, BridgeCodec::new(limits.max_frame_bytes)),
            out_rx,
            Arc::clone(&stats),
        ));

        Self {
            sender: BridgeSender {
                label: label.into(),
                outgoing: out_tx,
                pressure,
                max_frame_bytes: limits.max_frame_bytes,
            },
            incoming: in_rx,
            stats,
            reader,
            writer,
        }
    }

    /// Queue a frame for the bridge, waiting for room if the queue is full.
    pub async fn send(&self, frame: &BridgeFrame) -> Result<()> {
        self.sender.send(frame).await
    }

    pub fn sender(&self) -> BridgeSender {
        self.sender.clone()
    }

    /// Next valid frame from the bridge. `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<BridgeFrame> {
        self.incoming.recv().await
    }

    /// Watch that is `true` while either direction is backed up.
    pub fn pressure(&self) -> watch::Receiver<bool> {
        self.sender.pressure.tx.subscribe()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }
}

impl Drop for BridgeChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop<R>(
    label: String,
    mut frames: FramedRead<R, BridgeCodec>,
    tx: mpsc::Sender<BridgeFrame>,
    stats: Arc<ChannelStats>,
    pressure: Arc<Pressure>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(item) = frames.next().await {
        match item {
            Ok(Ok(frame)) => {
                stats.frames_in.fetch_add(1, Ordering::Relaxed);
                trace!(connector = %label, kind = frame.kind(), "bridge -> gateway");
                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(frame)) => {
                        warn!(connector = %label, "inbound bridge queue full, applying backpressure");
                        pressure.set_inbound(true);
                        let sent = tx.send(frame).await;
                        pressure.set_inbound(false);
                        if sent.is_err() {
                            break;
                        }
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Ok(Err(e)) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(connector = %label, error = %e, "dropping bridge frame");
            }
            Err(e) => {
                warn!(connector = %label, error = %e, "error reading from bridge");
                break;
            }
        }
    }
    debug!(connector = %label, "bridge stream closed");
}

async fn write_loop<W>(
    label: String,
    mut sink: FramedWrite<W, BridgeCodec>,
    mut rx: mpsc::Receiver<Bytes>,
    stats: Arc<ChannelStats>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(body) = rx.recv().await {
        if let Err(e) = sink.send(body).await {
            warn!(connector = %label, error = %e, "error writing to bridge");
            break;
        }
        stats.frames_out.fetch_add(1, Ordering::Relaxed);
    }
    debug!(connector = %label, "bridge writer finished");
}
