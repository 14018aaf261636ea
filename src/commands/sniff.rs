//! sniffer: stream address samples and print them as ranges

use std::io::{self, Write};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use twlfpga_core::transport::TransportResult;
use twlfpga_core::{Decoder, Progress, Session, StreamConfig, StreamConsumer, Transport};

use super::Result;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Stream consumer feeding the range decoder
pub struct SnifferConsumer<'a, W: Write> {
    decoder: Decoder<W>,
    shutdown: &'a AtomicBool,
    next_report: Duration,
    error: Option<io::Error>,
}

impl<'a, W: Write> SnifferConsumer<'a, W> {
    /// Decode into `out` until `shutdown` is set
    pub fn new(out: W, shutdown: &'a AtomicBool) -> Self {
        Self {
            decoder: Decoder::new(out),
            shutdown,
            next_report: REPORT_INTERVAL,
            error: None,
        }
    }

    fn poll_shutdown(&self) -> ControlFlow<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn report(&mut self, progress: &Progress) {
        if progress.elapsed < self.next_report {
            return;
        }
        log::debug!(
            "{} bytes, {} samples, {:.2} MB/s",
            progress.total_bytes,
            self.decoder.samples(),
            progress.rate() / 1_000_000.0
        );
        while self.next_report <= progress.elapsed {
            self.next_report += REPORT_INTERVAL;
        }
    }
}

impl<W: Write> StreamConsumer for SnifferConsumer<'_, W> {
    fn on_chunk(&mut self, chunk: &[u8], progress: &Progress) -> ControlFlow<()> {
        if let Err(e) = self.decoder.feed(chunk) {
            self.error = Some(e);
            return ControlFlow::Break(());
        }
        self.report(progress);
        self.poll_shutdown()
    }

    fn on_idle(&mut self, _progress: &Progress) -> ControlFlow<()> {
        self.poll_shutdown()
    }
}

/// Stream from the board returned by `connect` into `out`
///
/// Returns when `shutdown` is set or the transport fails. On a clean stop
/// the open run is terminated before returning.
pub fn run<T, F, W>(connect: F, out: W, shutdown: &AtomicBool) -> Result<()>
where
    T: Transport,
    F: FnOnce() -> TransportResult<T>,
    W: Write,
{
    let mut session = Session::new();
    session.open(connect)?;
    session.set_streaming_mode()?;

    let mut consumer = SnifferConsumer::new(out, shutdown);
    let streamed = session.read_stream(&mut consumer, &StreamConfig::default());
    session.close();
    let summary = streamed?;

    match consumer.error.take() {
        // Reader went away, e.g. piped into head
        Some(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Some(e) => return Err(e.into()),
        None => {}
    }
    consumer.decoder.finish()?;

    log::info!(
        "Captured {} samples ({} bytes) in {:.1}s",
        consumer.decoder.samples(),
        summary.total_bytes,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandError;
    use twlfpga_core::{Error, TransportError};
    use twlfpga_dummy::{frame, DummyBoard, ReadScript};

    #[test]
    fn test_sniff_until_shutdown() {
        let bytes = [0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x05];
        let board = DummyBoard::new().with_reads([ReadScript::Data(frame(&bytes, 512))]);
        let board_log = board.board_log();
        let shutdown = AtomicBool::new(true);
        let mut out = Vec::new();

        run(move || Ok(board), &mut out, &shutdown).unwrap();

        assert_eq!(out, b"000000..000003\n00000a+\n");
        assert_eq!(board_log.borrow().releases, 1);
    }

    #[test]
    fn test_consumer_carries_words_across_chunks() {
        let bytes = [0x00, 0x10, 0x00, 0x00, 0x10, 0x01, 0x00, 0x10, 0x02, 0x00, 0x20, 0x00];
        let shutdown = AtomicBool::new(false);
        let mut out = Vec::new();
        let progress = Progress {
            total_bytes: 0,
            elapsed: Duration::ZERO,
        };

        let mut consumer = SnifferConsumer::new(&mut out, &shutdown);
        for chunk in bytes.chunks(4) {
            assert!(consumer.on_chunk(chunk, &progress).is_continue());
        }
        assert!(consumer.on_idle(&progress).is_continue());
        shutdown.store(true, Ordering::Relaxed);
        assert!(consumer.on_idle(&progress).is_break());
        consumer.decoder.finish().unwrap();
        drop(consumer);

        assert_eq!(out, b"002000..002005\n004000+\n");
    }

    #[test]
    fn test_sniff_transport_failure() {
        let board = DummyBoard::new().with_reads([ReadScript::Error(TransportError::Disconnected)]);
        let board_log = board.board_log();
        let shutdown = AtomicBool::new(false);
        let mut out = Vec::new();

        let err = run(move || Ok(board), &mut out, &shutdown).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Session(Error::Io(TransportError::Disconnected))
        ));
        assert!(out.is_empty());
        assert_eq!(board_log.borrow().releases, 1);
    }

    #[test]
    fn test_sniff_mode_switch_failure() {
        let board = DummyBoard::new()
            .with_failing_mode(twlfpga_core::BitMode::SyncFifo, TransportError::Stall);
        let board_log = board.board_log();
        let shutdown = AtomicBool::new(true);

        let err = run(move || Ok(board), io::sink(), &shutdown).unwrap_err();
        assert!(matches!(err, CommandError::Session(Error::ModeSwitch(_))));
        assert_eq!(board_log.borrow().submits, 0);
        assert_eq!(board_log.borrow().releases, 1);
    }
}
