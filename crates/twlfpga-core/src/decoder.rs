//! Address stream decoder
//!
//! The capture FPGA pushes every sampled NOR address as three big-endian
//! bytes through the FIFO. USB chunking has no relation to that framing, so
//! [`WordAssembler`] carries a partially assembled word from one chunk into
//! the next. [`RunTracker`] then folds consecutive samples into ranges and
//! only reports discontinuities:
//!
//! ```text
//! 000000..000003
//! 00000a+
//! 00a000..00a7ff
//! ```
//!
//! Reported addresses are byte addresses, i.e. the sampled word index times
//! two. A range end is the last byte of its last word.

use core::fmt;
use std::io::{self, Write};

/// Number of bytes per sampled word on the wire
pub const WORD_BYTES: u8 = 3;

/// Mask of a sampled word
pub const WORD_MASK: u32 = 0x00FF_FFFF;

/// Big-endian 24-bit word assembler
///
/// Holds at most two unconsumed bytes between calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WordAssembler {
    acc: u32,
    filled: u8,
}

impl WordAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one byte in, returning the word it completes
    pub fn push(&mut self, byte: u8) -> Option<u32> {
        self.acc = (self.acc << 8) | byte as u32;
        self.filled += 1;
        if self.filled == WORD_BYTES {
            let word = self.acc & WORD_MASK;
            self.acc = 0;
            self.filled = 0;
            Some(word)
        } else {
            None
        }
    }

    /// Iterate over the words completed by `chunk`
    pub fn feed<'a>(&'a mut self, chunk: &'a [u8]) -> Words<'a> {
        Words {
            assembler: self,
            bytes: chunk.iter(),
        }
    }

    /// Number of bytes of the word currently being assembled (0-2)
    pub fn pending(&self) -> usize {
        self.filled as usize
    }
}

/// Iterator returned by [`WordAssembler::feed`]
#[derive(Debug)]
pub struct Words<'a> {
    assembler: &'a mut WordAssembler,
    bytes: core::slice::Iter<'a, u8>,
}

impl Iterator for Words<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        for &byte in self.bytes.by_ref() {
            if let Some(word) = self.assembler.push(byte) {
                return Some(word);
            }
        }
        None
    }
}

/// Output token of the range compressor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    /// A new run starts at this byte address
    Start(u32),
    /// The previous run was a single sample
    Single,
    /// The previous run ended at this byte address (inclusive)
    End(u32),
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::Start(addr) => write!(f, "{:06x}", addr),
            RunEvent::Single => writeln!(f, "+"),
            RunEvent::End(addr) => writeln!(f, "..{:06x}", addr),
        }
    }
}

/// Run-length compressor over sampled words
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTracker {
    last: Option<u32>,
    run_count: u32,
}

impl RunTracker {
    /// Create a tracker that has seen nothing yet
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent sample, if any
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Samples in the current run (0 before the first sample)
    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    /// Account for one sample and return the tokens it produces
    ///
    /// A continuation produces nothing. A discontinuity closes the previous
    /// run (if there is one) and opens a new one.
    pub fn observe(&mut self, word: u32) -> impl Iterator<Item = RunEvent> {
        let contiguous = self.last.and_then(|last| last.checked_add(1)) == Some(word);

        let (close, start) = if contiguous {
            (None, None)
        } else {
            let close = self.close_run();
            self.run_count = 0;
            (close, Some(RunEvent::Start(word.wrapping_mul(2))))
        };

        self.run_count += 1;
        self.last = Some(word);

        close.into_iter().chain(start)
    }

    /// Close the open run, if any
    ///
    /// The tracker is reset afterwards, so the next sample always starts a
    /// new run.
    pub fn finish(&mut self) -> Option<RunEvent> {
        let close = self.close_run();
        *self = Self::default();
        close
    }

    fn close_run(&self) -> Option<RunEvent> {
        match (self.run_count, self.last) {
            (0, _) | (_, None) => None,
            (1, Some(_)) => Some(RunEvent::Single),
            (_, Some(last)) => Some(RunEvent::End(last.wrapping_mul(2).wrapping_add(1))),
        }
    }
}

/// Streaming decoder writing range text to `W`
///
/// Word assembly and run tracking are kept as two separate pieces of state.
/// Output is flushed after every discontinuity so a terminal shows a range
/// start as soon as it is seen.
#[derive(Debug)]
pub struct Decoder<W: Write> {
    words: WordAssembler,
    runs: RunTracker,
    samples: u64,
    out: W,
}

impl<W: Write> Decoder<W> {
    /// Create a decoder writing to `out`
    pub fn new(out: W) -> Self {
        Self {
            words: WordAssembler::new(),
            runs: RunTracker::new(),
            samples: 0,
            out,
        }
    }

    /// Decode one chunk of raw stream bytes
    pub fn feed(&mut self, chunk: &[u8]) -> io::Result<()> {
        for word in self.words.feed(chunk) {
            self.samples += 1;
            let mut emitted = false;
            for event in self.runs.observe(word) {
                write!(self.out, "{}", event)?;
                emitted = true;
            }
            if emitted {
                self.out.flush()?;
            }
        }
        Ok(())
    }

    /// Terminate the open run, if any
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(event) = self.runs.finish() {
            write!(self.out, "{}", event)?;
            self.out.flush()?;
        }
        Ok(())
    }

    /// Number of complete samples decoded so far
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Bytes of a partial word carried over to the next chunk
    pub fn pending_bytes(&self) -> usize {
        self.words.pending()
    }

    /// Get a reference to the output
    pub fn get_ref(&self) -> &W {
        &self.out
    }

    /// Consume the decoder, returning the output
    pub fn into_inner(self) -> W {
        self.out
    }
}
