//! Continuous streaming read loop
//!
//! Keeps `queue_depth` bulk IN transfers in flight so the bridge never runs
//! out of buffers, and hands the payload of every completed packet to a
//! [`StreamConsumer`] in capture order.
//!
//! Every max-size USB packet coming from an FTDI bridge starts with two
//! modem status bytes; they are stripped here and never reach the consumer.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use crate::error::TransportError;
use crate::transport::{Channel, Transport};

/// Modem status bytes at the start of every FTDI packet
pub const FTDI_STATUS_LEN: usize = 2;

/// Default number of max-size packets per bulk transfer
pub const DEFAULT_PACKETS_PER_TRANSFER: usize = 32;

/// Default number of transfers kept in flight
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// How long to wait for a completion before calling [`StreamConsumer::on_idle`]
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound for draining cancelled transfers on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Streaming parameters
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Channel to read from
    pub channel: Channel,
    /// Size of one transfer, in max-size packets
    pub packets_per_transfer: usize,
    /// Transfers kept outstanding at all times
    pub queue_depth: usize,
    /// Completion wait before the consumer gets an idle callback
    pub idle_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel: Channel::A,
            packets_per_transfer: DEFAULT_PACKETS_PER_TRANSFER,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl StreamConfig {
    /// Set the transfer size in packets
    pub fn packets_per_transfer(mut self, packets: usize) -> Self {
        self.packets_per_transfer = packets.max(1);
        self
    }

    /// Set the number of in-flight transfers
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Set the idle callback interval
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Progress descriptor passed with every chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Payload bytes delivered so far, including the current chunk
    pub total_bytes: u64,
    /// Time since the first transfer was submitted
    pub elapsed: Duration,
}

impl Progress {
    /// Mean payload throughput in bytes per second
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Totals of a finished stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSummary {
    /// Payload bytes delivered
    pub total_bytes: u64,
    /// Chunks delivered
    pub chunks: u64,
    /// Wall time of the stream
    pub elapsed: Duration,
}

/// Receiver of streamed data
///
/// Any `FnMut(&[u8], &Progress) -> ControlFlow<()>` closure is a consumer.
pub trait StreamConsumer {
    /// Handle one chunk; `Break` stops the stream
    fn on_chunk(&mut self, chunk: &[u8], progress: &Progress) -> ControlFlow<()>;

    /// Called when no data arrived within the idle timeout
    fn on_idle(&mut self, _progress: &Progress) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

impl<F> StreamConsumer for F
where
    F: FnMut(&[u8], &Progress) -> ControlFlow<()>,
{
    fn on_chunk(&mut self, chunk: &[u8], progress: &Progress) -> ControlFlow<()> {
        self(chunk, progress)
    }
}

/// Split a completed transfer into packet payloads
///
/// Empty payloads (status-only packets) are skipped.
pub fn packet_payloads(data: &[u8], packet_size: usize) -> impl Iterator<Item = &[u8]> {
    data.chunks(packet_size.max(FTDI_STATUS_LEN + 1))
        .filter(|packet| packet.len() > FTDI_STATUS_LEN)
        .map(|packet| &packet[FTDI_STATUS_LEN..])
}

/// Run the streaming loop until the consumer stops it or the transport fails
pub(crate) fn run<T, C>(
    transport: &mut T,
    consumer: &mut C,
    config: &StreamConfig,
) -> Result<StreamSummary, TransportError>
where
    T: Transport + ?Sized,
    C: StreamConsumer + ?Sized,
{
    let channel = config.channel;
    let packet_size = transport.max_packet_size();
    let transfer_len = config.packets_per_transfer.max(1) * packet_size;
    let queue_depth = config.queue_depth.max(1);

    transport.purge_rx(channel)?;

    log::debug!(
        "Starting stream on channel {}: {} x {} byte transfers",
        channel,
        queue_depth,
        transfer_len
    );

    let started = Instant::now();
    let mut total_bytes = 0u64;
    let mut chunks = 0u64;

    let outcome = prime(transport, channel, transfer_len, queue_depth).and_then(|()| loop {
        let completion = transport.wait_read(channel, config.idle_timeout);
        let progress = Progress {
            total_bytes,
            elapsed: started.elapsed(),
        };

        let data = match completion {
            None => {
                if consumer.on_idle(&progress).is_break() {
                    break Ok(());
                }
                continue;
            }
            Some(Err(e)) => break Err(e),
            Some(Ok(data)) => data,
        };

        log::trace!("Completed transfer of {} bytes", data.len());

        let mut stop = false;
        for payload in packet_payloads(&data, packet_size) {
            total_bytes += payload.len() as u64;
            chunks += 1;
            let progress = Progress {
                total_bytes,
                elapsed: started.elapsed(),
            };
            if consumer.on_chunk(payload, &progress).is_break() {
                stop = true;
                break;
            }
        }
        if stop {
            break Ok(());
        }

        if let Err(e) = transport.submit_read(channel, transfer_len) {
            break Err(e);
        }
    });

    drain(transport, channel);

    let summary = StreamSummary {
        total_bytes,
        chunks,
        elapsed: started.elapsed(),
    };

    match outcome {
        Ok(()) => {
            log::debug!(
                "Stream stopped after {} bytes in {:.1}s",
                summary.total_bytes,
                summary.elapsed.as_secs_f64()
            );
            Ok(summary)
        }
        Err(e) => Err(e),
    }
}

/// Submit the whole queue before the first completion is awaited
pub(crate) fn prime<T: Transport + ?Sized>(
    transport: &mut T,
    channel: Channel,
    transfer_len: usize,
    queue_depth: usize,
) -> Result<(), TransportError> {
    for _ in 0..queue_depth {
        transport.submit_read(channel, transfer_len)?;
    }
    Ok(())
}

/// Cancel outstanding transfers and wait for them to come back
pub(crate) fn drain<T: Transport + ?Sized>(transport: &mut T, channel: Channel) {
    transport.cancel_reads(channel);
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while transport.pending_reads(channel) > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || transport.wait_read(channel, remaining).is_none() {
            log::warn!(
                "{} transfers still pending after cancel",
                transport.pending_reads(channel)
            );
            break;
        }
    }
}
