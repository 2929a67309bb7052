//! Per-device command dispatcher.
//!
//! One worker task per connected PSU owns the device session and drains a
//! FIFO job queue, so requests from the poll scheduler and the bus adapter
//! are serialized onto the wire without the callers coordinating. The worker
//! applies the timeout/retry policy per request and declares the link dead
//! after repeated failed cycles.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use rd60xx_proto::frame::{self, Frame};
use rd60xx_proto::registers::{self, Scaling, UNIT_ADDRESS, WriteOp, reg};
use rd60xx_proto::{RegisterError, Snapshot, StateSet};

use crate::device::{DeviceSession, SessionState};
use crate::error::CommandError;

/// Consecutive failed request cycles after which the link is assumed dead.
const MAX_FAILED_CYCLES: u32 = 2;

/// Commands accepted by a device worker.
#[derive(Debug)]
pub enum Command {
    /// Full telemetry read (main block plus presets).
    ReadTelemetry,
    /// Apply a state-write request.
    ApplySet(StateSet),
    /// Set the on-unit clock.
    SetClock {
        year: u16,
        month: u16,
        day: u16,
        hour: u16,
        minute: u16,
        second: u16,
    },
}

/// Successful command outcome.
#[derive(Debug)]
pub enum CommandResult {
    Telemetry(Box<Snapshot>),
    Applied,
}

/// One queued command with its reply slot. Opaque outside the dispatcher;
/// created by [`DispatcherHandle::submit`], consumed by [`Dispatcher::run`].
pub struct Job {
    command: Command,
    reply: oneshot::Sender<Result<CommandResult, CommandError>>,
}

/// Cloneable submission side of a device's job queue.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Job>,
}

impl DispatcherHandle {
    /// Enqueue a command and await its resolution.
    ///
    /// Every submission resolves: with a result, a command error, or
    /// `SessionClosed` when the worker is gone.
    pub async fn submit(&self, command: Command) -> Result<CommandResult, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CommandError::SessionClosed)?;
        reply_rx.await.map_err(|_| CommandError::SessionClosed)?
    }

    /// Submit a full telemetry read.
    pub async fn read_telemetry(&self) -> Result<Snapshot, CommandError> {
        match self.submit(Command::ReadTelemetry).await? {
            CommandResult::Telemetry(snapshot) => Ok(*snapshot),
            CommandResult::Applied => unreachable!("telemetry read resolved without a snapshot"),
        }
    }

    /// Submit a state-write request.
    pub async fn apply_set(&self, set: StateSet) -> Result<(), CommandError> {
        self.submit(Command::ApplySet(set)).await.map(|_| ())
    }
}

/// Create a job queue and its submission handle.
pub fn channel(depth: usize) -> (DispatcherHandle, mpsc::Receiver<Job>) {
    let (tx, rx) = mpsc::channel(depth);
    (DispatcherHandle { tx }, rx)
}

enum Wake {
    Job(Option<Job>),
    Link(CommandError),
}

/// Worker owning one device session.
pub struct Dispatcher<S> {
    session: DeviceSession<S>,
    scaling: Scaling,
    timeout: Duration,
    retries: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Dispatcher<S> {
    pub fn new(session: DeviceSession<S>, scaling: Scaling, timeout: Duration, retries: u32) -> Self {
        Self {
            session,
            scaling,
            timeout,
            retries,
        }
    }

    /// Run the worker loop until the session closes, the link is declared
    /// dead, or every handle is dropped. Queued jobs are resolved
    /// `SessionClosed` on the way out so no caller hangs.
    pub async fn run(mut self, mut jobs: mpsc::Receiver<Job>) {
        let mut failed_cycles = 0u32;

        loop {
            let wake = tokio::select! {
                job = jobs.recv() => Wake::Job(job),
                err = self.session.idle_read() => Wake::Link(err),
            };

            match wake {
                Wake::Job(Some(Job { command, reply })) => {
                    let result = self.execute(&command).await;
                    match &result {
                        Ok(_) => failed_cycles = 0,
                        Err(CommandError::Timeout) => {
                            failed_cycles += 1;
                            warn!(
                                peer = %self.session.peer(),
                                cycles = failed_cycles,
                                "request cycle timed out"
                            );
                        }
                        Err(_) => {}
                    }
                    let dead = self.session.state() == SessionState::Closed
                        || failed_cycles >= MAX_FAILED_CYCLES;
                    let _ = reply.send(result);
                    if dead {
                        debug!(peer = %self.session.peer(), "closing session");
                        break;
                    }
                }
                Wake::Job(None) => break,
                Wake::Link(err) => {
                    debug!(
                        peer = %self.session.peer(),
                        %err,
                        idle_secs = self.session.idle_secs(),
                        "link closed"
                    );
                    break;
                }
            }
        }

        jobs.close();
        while let Ok(Job { reply, .. }) = jobs.try_recv() {
            let _ = reply.send(Err(CommandError::SessionClosed));
        }
    }

    async fn execute(&mut self, command: &Command) -> Result<CommandResult, CommandError> {
        match command {
            Command::ReadTelemetry => {
                let main = self
                    .read_block(registers::TELEMETRY_START, registers::TELEMETRY_COUNT)
                    .await?;
                let presets = self
                    .read_block(registers::PRESET_START, registers::PRESET_COUNT)
                    .await?;
                let snapshot = registers::decode_snapshot(&main, &presets)?;
                Ok(CommandResult::Telemetry(Box::new(snapshot)))
            }
            Command::ApplySet(set) => {
                for op in registers::encode_set(set, self.scaling) {
                    self.write_op(&op).await?;
                }
                // Toggle last, so it wins over an explicit output_enable in
                // the same request.
                if set.output_toggle == Some(true) {
                    let current = self.read_block(reg::OUTPUT_ENABLE, 1).await?;
                    let enable = current.first().copied() == Some(0);
                    self.write_op(&registers::output_enable_op(enable)).await?;
                }
                Ok(CommandResult::Applied)
            }
            Command::SetClock {
                year,
                month,
                day,
                hour,
                minute,
                second,
            } => {
                let op = registers::clock_op(*year, *month, *day, *hour, *minute, *second);
                self.write_op(&op).await?;
                Ok(CommandResult::Applied)
            }
        }
    }

    async fn read_block(&mut self, start: u16, count: u16) -> Result<Vec<u16>, CommandError> {
        let request = frame::read_request(UNIT_ADDRESS, start, count);
        let frame = self
            .transact_with_retry(&request, frame::FUNC_READ_HOLDING)
            .await?;
        let words = frame.registers()?;
        if words.len() != count as usize {
            return Err(RegisterError::BlockLength {
                expected: count as usize,
                got: words.len(),
            }
            .into());
        }
        Ok(words)
    }

    async fn write_op(&mut self, op: &WriteOp) -> Result<(), CommandError> {
        let (request, function) = match op {
            WriteOp::Single { register, value } => (
                frame::write_single_request(UNIT_ADDRESS, *register, *value),
                frame::FUNC_WRITE_SINGLE,
            ),
            WriteOp::Block { start, values } => (
                frame::write_multiple_request(UNIT_ADDRESS, *start, values),
                frame::FUNC_WRITE_MULTIPLE,
            ),
        };
        self.transact_with_retry(&request, function).await?;
        Ok(())
    }

    /// One request cycle: the wire request plus up to `retries` re-sends on
    /// timeout. The protocol has no sequence numbers; a late response to a
    /// superseded attempt is discarded by the session as stale.
    async fn transact_with_retry(
        &mut self,
        request: &[u8],
        function: u8,
    ) -> Result<Frame, CommandError> {
        for attempt in 0..=self.retries {
            match self.session.transact(request, function, self.timeout).await {
                Err(CommandError::Timeout) => {
                    debug!(peer = %self.session.peer(), attempt, "request attempt timed out");
                }
                other => return other,
            }
        }
        Err(CommandError::Timeout)
    }
}
