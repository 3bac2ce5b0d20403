//! Splits a container output stream into log records

use crate::config::DEFAULT_MAX_RECORD_BYTES;
use crate::errors::{Result, ShimError};
use crate::loss::{LossEvent, LossReason, LossReporter};
use crate::record::{LogRecord, Source};

use futures::Stream;
use std::pin::Pin;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const DELIMITER: u8 = b'\n';

/// Turns one byte stream into newline-delimited [`LogRecord`]s.
///
/// Bytes are opaque: nothing is decoded or validated. A record is stamped
/// when its delimiter is seen, and an unterminated fragment is flushed as
/// the final record when the stream ends. A line longer than
/// `max_record_bytes` is cut into several records so a stream that never
/// writes a newline cannot grow the buffer without bound.
pub struct RecordFramer<R> {
    reader: BufReader<R>,
    source: Source,
    max_record_bytes: usize,
    next_sequence: u64,
    buf: Vec<u8>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> RecordFramer<R> {
    pub fn new(reader: R, source: Source) -> Self {
        Self {
            reader: BufReader::new(reader),
            source,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            next_sequence: 0,
            buf: Vec::new(),
            finished: false,
        }
    }

    /// Cut records at `max_record_bytes` instead of the default
    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes.max(1);
        self
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Read the next record, or `None` once the stream is exhausted.
    ///
    /// Safe to drop mid-read: partially read bytes stay buffered and the
    /// next call continues the same record.
    pub async fn next_record(&mut self) -> std::io::Result<Option<LogRecord>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let available = match self.reader.fill_buf().await {
                Ok(available) => available,
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };

            if available.is_empty() {
                self.finished = true;
                return Ok(self.take_fragment());
            }

            // One byte past the room left so a delimiter right at the cap
            // ends this record instead of producing an empty one
            let room = self.max_record_bytes.saturating_sub(self.buf.len());
            let window = &available[..available.len().min(room.saturating_add(1))];

            if let Some(pos) = window.iter().position(|b| *b == DELIMITER) {
                self.buf.extend_from_slice(&window[..pos]);
                Pin::new(&mut self.reader).consume(pos + 1);
                return Ok(Some(self.emit()));
            }

            let taken = window.len().min(room);
            self.buf.extend_from_slice(&window[..taken]);
            Pin::new(&mut self.reader).consume(taken);

            if self.buf.len() >= self.max_record_bytes {
                debug!(
                    "{} line exceeds {} bytes, splitting it",
                    self.source, self.max_record_bytes
                );
                return Ok(Some(self.emit()));
            }
        }
    }

    /// Flush whatever unterminated bytes are buffered
    pub fn take_fragment(&mut self) -> Option<LogRecord> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.emit())
        }
    }

    /// Consume the framer as a lazy stream of records
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<LogRecord>> {
        futures::stream::unfold(self, |mut framer| async move {
            match framer.next_record().await {
                Ok(Some(record)) => Some((Ok(record), framer)),
                Ok(None) => None,
                Err(e) => Some((Err(e), framer)),
            }
        })
    }

    /// Frame every byte already pulled from the stream without reading more
    pub fn drain_buffered(&mut self) -> Vec<LogRecord> {
        let pending = self.reader.buffer().to_vec();
        Pin::new(&mut self.reader).consume(pending.len());
        self.buf.extend_from_slice(&pending);
        self.finished = true;

        let mut records = Vec::new();
        loop {
            let window = self.buf.len().min(self.max_record_bytes.saturating_add(1));
            let (end, next) = match self.buf[..window].iter().position(|b| *b == DELIMITER) {
                Some(pos) => (pos, pos + 1),
                None if self.buf.len() > self.max_record_bytes => {
                    (self.max_record_bytes, self.max_record_bytes)
                }
                None => break,
            };
            let rest = self.buf.split_off(next);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.truncate(end);
            records.push(self.record_from(line));
        }
        records.extend(self.take_fragment());
        records
    }

    /// Forward records into the accumulator until end of stream or shutdown.
    ///
    /// On shutdown no further reads are issued; bytes already buffered are
    /// still framed and forwarded. Returns the number of records forwarded.
    /// A read error is fatal for the pipeline and is returned as
    /// [`ShimError::Upstream`].
    #[instrument(skip_all, fields(source = %self.source))]
    pub async fn forward(
        mut self,
        records: mpsc::Sender<LogRecord>,
        shutdown: CancellationToken,
        losses: LossReporter,
    ) -> Result<u64> {
        let source = self.source;
        let mut forwarded = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                next = self.next_record() => next.map_err(|error| ShimError::Upstream {
                    source_name: source.as_str(),
                    error,
                })?,
            };

            let Some(record) = next else {
                info!("{} reached end of stream after {} records", source, forwarded);
                return Ok(forwarded);
            };

            if !send(&records, record, &losses).await {
                return Ok(forwarded);
            }
            forwarded += 1;
        }

        let remaining = self.drain_buffered();
        debug!(
            "Shutdown requested, flushing {} buffered {} records",
            remaining.len(),
            self.source
        );
        for record in remaining {
            if !send(&records, record, &losses).await {
                break;
            }
            forwarded += 1;
        }

        info!("{} reader sealed after {} records", self.source, forwarded);
        Ok(forwarded)
    }

    fn emit(&mut self) -> LogRecord {
        let payload = std::mem::take(&mut self.buf);
        self.record_from(payload)
    }

    fn record_from(&mut self, payload: Vec<u8>) -> LogRecord {
        let record = LogRecord::new(self.source, self.next_sequence, payload);
        self.next_sequence += 1;
        record
    }
}

async fn send(
    records: &mpsc::Sender<LogRecord>,
    record: LogRecord,
    losses: &LossReporter,
) -> bool {
    match records.send(record).await {
        Ok(()) => true,
        Err(mpsc::error::SendError(record)) => {
            losses.report(LossEvent::for_records(
                LossReason::DrainDeadline,
                std::slice::from_ref(&record),
                "accumulator stopped before the record was accepted",
            ));
            false
        }
    }
}
