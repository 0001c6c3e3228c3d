// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Background listening on the input endpoint
//!
//! A dedicated OS thread repeatedly performs blocking bulk reads with a
//! short timeout and emits every decoded MIDI message as an [`Event`].
//! Stopping is cooperative: a flag is checked before each read and the
//! read timeout bounds the latency until the thread notices it.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use thiserror::Error;

use crate::{
    event::{Event, EventHandler, TerminationCause},
    message::MidiMessage,
    packet::{self, CableNumber, PACKET_SIZE},
    usb::{DeviceId, UsbDeviceHandle},
};


#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("thread terminated before it started listening")]
    NotStarted,
}

/// Everything the listener thread needs and owns.
#[expect(missing_debug_implementations)]
pub struct Environment<H> {
    pub handle: Arc<H>,
    pub device_id: DeviceId,
    pub endpoint_address: u8,
    pub cable: CableNumber,
    pub read_timeout: Duration,
    /// Should be a multiple of [`PACKET_SIZE`].
    pub read_buffer_size: usize,
    pub event_handler: Arc<dyn EventHandler>,
}

/// Decode all complete packets and pass the messages to `emit`.
///
/// A trailing, incomplete packet is discarded. Packets that are dropped
/// by the decoder don't emit anything.
///
/// Returns the number of emitted messages.
pub fn consume_packets(
    data: &[u8],
    cable: CableNumber,
    mut emit: impl FnMut(MidiMessage),
) -> usize {
    let chunks = data.chunks_exact(PACKET_SIZE);
    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        log::debug!(
            "Discarding incomplete packet {remainder:02x?} (len = {len})",
            len = remainder.len()
        );
    }
    let mut emitted = 0;
    for chunk in chunks {
        let Some(message) = MidiMessage::from_bytes(packet::decode(chunk, cable)) else {
            continue;
        };
        log::trace!("Received MIDI message: {message}");
        emit(message);
        emitted += 1;
    }
    emitted
}

fn thread_fn<H>(environment: &Environment<H>, stop: &AtomicBool) -> TerminationCause
where
    H: UsbDeviceHandle,
{
    let Environment {
        handle,
        device_id,
        endpoint_address,
        cable,
        read_timeout,
        read_buffer_size,
        event_handler,
    } = environment;
    let mut read_buf = vec![0; *read_buffer_size];
    while !stop.load(Ordering::Acquire) {
        let read_result = handle.bulk_read(*endpoint_address, &mut read_buf, *read_timeout);
        let bytes_read = match read_result {
            Ok(bytes_read) => bytes_read,
            Err(err) if err.is_transient() => {
                log::debug!("Reading from device {device_id} failed: {err}");
                continue;
            }
            Err(err) => {
                log::warn!("Reading from device {device_id} failed: {err}");
                return TerminationCause::ConnectionLost;
            }
        };
        if bytes_read == 0 {
            // Nothing available during this cycle
            continue;
        }
        debug_assert!(bytes_read <= read_buf.len());
        consume_packets(&read_buf[..bytes_read], *cable, |message| {
            event_handler.handle_event(Event::MessageReceived {
                device_id: *device_id,
                message,
            });
        });
    }
    TerminationCause::Stopped
}

/// Dedicated listener thread
#[derive(Debug)]
pub struct Listener {
    device_id: DeviceId,
    stop: Arc<AtomicBool>,
    join_handle: JoinHandle<TerminationCause>,
}

impl Listener {
    /// Spawn the listener thread.
    ///
    /// Only returns after the thread has started listening.
    pub fn spawn<H>(environment: Environment<H>) -> Result<Self, ListenerError>
    where
        H: UsbDeviceHandle + Send + Sync + 'static,
    {
        let device_id = environment.device_id;
        let stop = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::sync_channel(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("usb-midi-listener-{device_id}"))
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    log::info!("Listening on device {device_id}");
                    // The receiver is still waiting and only dropped afterwards.
                    let _ = started_tx.send(());
                    let cause = thread_fn(&environment, &stop);
                    log::info!("Stopped listening on device {device_id}: {cause:?}");
                    environment
                        .event_handler
                        .handle_event(Event::ListeningTerminated { device_id, cause });
                    cause
                }
            })?;
        log::debug!("Spawned thread: {join_handle:?}");
        if started_rx.recv().is_err() {
            // Join the thread to collect the panic
            if let Err(err) = join_handle.join() {
                log::error!("Listener thread panicked: {err:?}");
            }
            return Err(ListenerError::NotStarted);
        }
        Ok(Self {
            device_id,
            stop,
            join_handle,
        })
    }

    #[must_use]
    pub const fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Check if the thread is still listening.
    ///
    /// Returns `false` after the connection has been lost.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }

    /// Signal the thread to stop and wait until it has terminated.
    ///
    /// Returns within the read timeout.
    pub fn stop_and_join(self) -> anyhow::Result<TerminationCause> {
        let Self {
            device_id,
            stop,
            join_handle,
        } = self;
        stop.store(true, Ordering::Release);
        log::debug!("Joining listener thread for device {device_id}: {join_handle:?}");
        join_handle
            .join()
            .map_err(|err| anyhow::anyhow!("Listener thread panicked: {err:?}"))
    }
}
