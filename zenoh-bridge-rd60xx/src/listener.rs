//! Reverse-TCP connection listener and per-PSU on-boarding.
//!
//! The PSUs are the TCP clients. Each accepted connection runs the
//! identification handshake, registers the unit, and wires up its dispatcher
//! worker and poll task. Everything after the accept happens on the
//! connection's own task, so one misbehaving unit never stalls the others.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Local, Timelike};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use rd60xx_proto::frame::{self, FUNC_READ_HOLDING};
use rd60xx_proto::registers::{self, Scaling, UNIT_ADDRESS};

use crate::config::PsuConfig;
use crate::device::DeviceSession;
use crate::dispatcher::{self, Command, Dispatcher};
use crate::error::CommandError;
use crate::messages::{BusEvent, StatePayload};
use crate::poller::Poller;
use crate::registry::Registry;

/// Jobs queued per device before submitters back off.
const JOB_QUEUE_DEPTH: usize = 64;

/// Bind the listener and serve until cancelled.
pub async fn run(
    config: PsuConfig,
    registry: Arc<Registry>,
    events: mpsc::Sender<BusEvent>,
) -> Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind TCP socket to {}", config.listen))?;

    info!("PSU listener started on {}", config.listen);
    serve(listener, config, registry, events).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    config: PsuConfig,
    registry: Arc<Registry>,
    events: mpsc::Sender<BusEvent>,
) -> Result<()> {
    let config = Arc::new(config);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(peer = %addr, "PSU connected");
                let config = config.clone();
                let registry = registry.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_connection(stream, addr, config, registry, events).await
                    {
                        debug!(peer = %addr, %err, "connection ended");
                    }
                });
            }
            Err(e) => {
                error!("TCP accept error: {}", e);
            }
        }
    }
}

/// On-board one connection: handshake, register, serve, tear down.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<PsuConfig>,
    registry: Arc<Registry>,
    events: mpsc::Sender<BusEvent>,
) -> Result<(), CommandError> {
    let mut session = DeviceSession::new(stream, addr);
    let timeout = Duration::from_millis(config.request_timeout_ms);

    // Identification handshake: the unit only speaks register reads, so
    // identity comes from the model/serial block.
    let (model, serial_no) = identify(&mut session, timeout, config.request_retries).await?;
    let Some(scaling) = Scaling::for_model(model) else {
        warn!(peer = %addr, model, "unknown model, dropping connection");
        return Ok(());
    };
    session.mark_identified();

    let identity = format!("{model}_{serial_no}");
    let name = registry.display_name(&identity);
    info!(peer = %addr, %identity, %name, "PSU identified");

    let (handle, jobs) = dispatcher::channel(JOB_QUEUE_DEPTH);
    let period = registry.stored_period(&identity);
    let (period_tx, period_rx) = watch::channel(period);

    session.mark_active();
    let worker = tokio::spawn(
        Dispatcher::new(session, scaling, timeout, config.request_retries).run(jobs),
    );
    let poller = tokio::spawn(
        Poller::new(
            identity.clone(),
            registry.clone(),
            handle.clone(),
            events.clone(),
            period_rx,
        )
        .run(),
    );

    let generation = registry.attach(
        &identity,
        model,
        serial_no,
        handle.clone(),
        period_tx,
        poller.abort_handle(),
        worker.abort_handle(),
    );

    // Announce the unit: online notification, then the refreshed list.
    let _ = events
        .send(BusEvent::State {
            identity: identity.clone(),
            payload: StatePayload::connectivity(true, period),
        })
        .await;
    let _ = events.send(BusEvent::List(registry.list())).await;

    if config.set_clock_on_connect {
        if let Err(err) = set_clock(&handle).await {
            warn!(%identity, %err, "failed to set clock");
        }
    }

    // First full read so consumers see telemetry without waiting a period.
    match handle.read_telemetry().await {
        Ok(snapshot) => {
            registry.update_snapshot(&identity, snapshot.clone());
            let period = registry.stored_period(&identity);
            let _ = events
                .send(BusEvent::State {
                    identity: identity.clone(),
                    payload: StatePayload::full(period, snapshot),
                })
                .await;
        }
        Err(err) => {
            warn!(%identity, %err, "initial telemetry read failed");
        }
    }

    // The worker owns the socket; when it ends the session is gone.
    let _ = worker.await;

    if registry.detach_if(&identity, generation) {
        info!(%identity, "PSU disconnected");
        let period = registry.stored_period(&identity);
        let _ = events
            .send(BusEvent::State {
                identity: identity.clone(),
                payload: StatePayload::connectivity(false, period),
            })
            .await;
        let _ = events.send(BusEvent::List(registry.list())).await;
    }

    Ok(())
}

/// Read the identity block with the standard deadline/retry policy.
async fn identify(
    session: &mut DeviceSession<TcpStream>,
    timeout: Duration,
    retries: u32,
) -> Result<(u16, u32), CommandError> {
    let request = frame::read_request(
        UNIT_ADDRESS,
        registers::TELEMETRY_START,
        registers::IDENTITY_COUNT,
    );

    for _ in 0..=retries {
        match session.transact(&request, FUNC_READ_HOLDING, timeout).await {
            Ok(frame) => {
                let words = frame.registers()?;
                return Ok(registers::decode_identity(&words)?);
            }
            Err(CommandError::Timeout) => {}
            Err(err) => return Err(err),
        }
    }
    Err(CommandError::Timeout)
}

/// Push the host local time to the unit's clock registers.
async fn set_clock(handle: &dispatcher::DispatcherHandle) -> Result<(), CommandError> {
    let now = Local::now();
    handle
        .submit(Command::SetClock {
            year: now.year() as u16,
            month: now.month() as u16,
            day: now.day() as u16,
            hour: now.hour() as u16,
            minute: now.minute() as u16,
            second: now.second() as u16,
        })
        .await
        .map(|_| ())
}
