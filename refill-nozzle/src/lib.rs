//! A line-framed serial transport to the nozzle controller (spec
//! §4.1). Records are ASCII `verb(arg1,arg2,...)`, one per line.
//!
//! Outbound *expect-response* commands (`heartbeat`, `meter_read`,
//! `rfid_get`, `hls_read`) are correlated with the next inbound frame
//! of the same verb family; fire-and-forget commands are written and
//! forgotten. A background task owns the transport; the handle
//! (`SerialNozzlePort`) is what the supervisor holds and calls
//! `NozzlePort::send`/`next_event` on.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use refill_api::nozzle::{NozzleCommand, NozzleFrame, VerbFamily};
use refill_api::{Error, NozzlePort, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PortConfig {
    pub path: String,
    pub baud: u32,
    pub response_timeout: Duration,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            path: String::from("/dev/ttyUSB0"),
            baud: 460_800,
            response_timeout: Duration::from_secs(5),
        }
    }
}

struct PendingEntry {
    family: VerbFamily,
    reply: oneshot::Sender<Result<NozzleFrame>>,
    deadline: Instant,
}

/// The supervisor-facing handle. Cheap to hold; the background task
/// does the actual I/O.
pub struct SerialNozzlePort {
    writer: mpsc::Sender<String>,
    register: mpsc::Sender<PendingEntry>,
    events: mpsc::Receiver<NozzleFrame>,
    response_timeout: Duration,
}

impl SerialNozzlePort {
    /// Opens the serial device (8-N-1, the configured baud) and spawns
    /// the task that owns the framed transport.
    pub fn open(cfg: PortConfig) -> Result<Self> {
        let port = tokio_serial::new(&cfg.path, cfg.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| Error::OperationError(format!("couldn't open {}: {}", cfg.path, e)))?;

        let framed = Framed::new(port, LinesCodec::new_with_max_length(512));
        let (sink, stream) = framed.split();

        let (writer_tx, writer_rx) = mpsc::channel::<String>(64);
        let (register_tx, register_rx) = mpsc::channel::<PendingEntry>(64);
        let (events_tx, events_rx) = mpsc::channel::<NozzleFrame>(256);

        tokio::spawn(run_reader(stream, register_rx, events_tx));
        tokio::spawn(run_writer(sink, writer_rx));

        Ok(SerialNozzlePort {
            writer: writer_tx,
            register: register_tx,
            events: events_rx,
            response_timeout: cfg.response_timeout,
        })
    }
}

#[async_trait]
impl NozzlePort for SerialNozzlePort {
    async fn send(&mut self, cmd: NozzleCommand) -> Result<Option<NozzleFrame>> {
        let line = cmd.to_string();

        if let Some(family) = cmd.family().filter(|_| cmd.expect_response()) {
            let (tx, rx) = oneshot::channel();

            self.register
                .send(PendingEntry {
                    family,
                    reply: tx,
                    deadline: Instant::now() + self.response_timeout,
                })
                .await?;

            self.writer.send(line).await.map_err(|_| {
                Error::MissingPeer(String::from("nozzle transport is closed"))
            })?;

            rx.await?.map(Some)
        } else {
            self.writer.send(line).await.map_err(|_| {
                Error::MissingPeer(String::from("nozzle transport is closed"))
            })?;

            Ok(None)
        }
    }

    async fn next_event(&mut self) -> Option<NozzleFrame> {
        self.events.recv().await
    }
}

// Owns the write half of the transport. A separate task from the
// reader so a slow/blocked reply correlation never stalls outbound
// fire-and-forget commands.
async fn run_writer(
    mut sink: futures::stream::SplitSink<Framed<tokio_serial::SerialStream, LinesCodec>, String>,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            warn!("nozzle transport write failed -- {}", e);
            break;
        }
    }
}

// Owns the read half of the transport plus the pending-request table.
// Every inbound frame is published to `events` before correlation is
// attempted (spec §4.1); a periodic sweep expires stale pending
// entries without touching the transport (spec §5).
async fn run_reader(
    mut stream: futures::stream::SplitStream<Framed<tokio_serial::SerialStream, LinesCodec>>,
    mut register_rx: mpsc::Receiver<PendingEntry>,
    events_tx: mpsc::Sender<NozzleFrame>,
) {
    let mut pending: VecDeque<PendingEntry> = VecDeque::new();
    let mut sweep = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            line = stream.next() => {
                match line {
                    Some(Ok(line)) => {
                        match NozzleFrame::parse(&line) {
                            Ok(frame) => {
                                let _ = events_tx.send(frame.clone()).await;
                                resolve_if_pending(&mut pending, frame);
                            }
                            Err(e) => warn!("dropping malformed nozzle frame -- {}", e),
                        }
                    }
                    Some(Err(e)) => {
                        warn!("nozzle transport read error -- {}", e);
                        break;
                    }
                    None => break,
                }
            }

            Some(entry) = register_rx.recv() => {
                debug_assert!(
                    !pending.iter().any(|p| p.family == entry.family),
                    "a second request of family {:?} was issued before the first resolved",
                    entry.family,
                );
                pending.push_back(entry);
            }

            _ = sweep.tick() => {
                let now = Instant::now();
                let mut i = 0;
                while i < pending.len() {
                    if pending[i].deadline <= now {
                        let entry = pending.remove(i).unwrap();
                        debug!("nozzle request of family {:?} timed out", entry.family);
                        let _ = entry.reply.send(Err(Error::TimeoutError));
                    } else {
                        i += 1;
                    }
                }
            }
        }
    }
}

fn resolve_if_pending(pending: &mut VecDeque<PendingEntry>, frame: NozzleFrame) {
    if frame.always_unsolicited() {
        return;
    }

    let family = frame.family();

    if let Some(pos) = pending.iter().position(|p| p.family == family) {
        let entry = pending.remove(pos).unwrap();
        let _ = entry.reply.send(Ok(frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refill_api::model::{NozzleId, Tag};

    fn nid() -> NozzleId {
        "0076".parse().unwrap()
    }

    #[test]
    fn resolves_oldest_pending_of_matching_family() {
        let mut pending = VecDeque::new();
        let (tx, mut rx) = oneshot::channel();

        pending.push_back(PendingEntry {
            family: VerbFamily::MeterRead,
            reply: tx,
            deadline: Instant::now() + Duration::from_secs(5),
        });

        resolve_if_pending(&mut pending, NozzleFrame::MeterRead { liters: 4.1 });

        assert!(pending.is_empty());
        assert_eq!(rx.try_recv().unwrap().unwrap(), NozzleFrame::MeterRead { liters: 4.1 });
    }

    #[test]
    fn rfid_match_never_resolves_a_pending_rfid_get() {
        let mut pending = VecDeque::new();
        let (tx, mut rx) = oneshot::channel();

        pending.push_back(PendingEntry {
            family: VerbFamily::RfidGet,
            reply: tx,
            deadline: Instant::now() + Duration::from_secs(5),
        });

        resolve_if_pending(
            &mut pending,
            NozzleFrame::RfidMatch { nozzle: nid(), seq: 1 },
        );

        assert_eq!(pending.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unrelated_family_is_left_pending() {
        let mut pending = VecDeque::new();
        let (tx, _rx) = oneshot::channel();

        pending.push_back(PendingEntry {
            family: VerbFamily::MeterRead,
            reply: tx,
            deadline: Instant::now() + Duration::from_secs(5),
        });

        resolve_if_pending(
            &mut pending,
            NozzleFrame::RfidGet {
                nozzle: nid(),
                tag: Tag::None,
                battery: 0,
            },
        );

        assert_eq!(pending.len(), 1);
    }
}
