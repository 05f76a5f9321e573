//! Async channel bridge between Tokio runtime and USB worker thread

use crate::usb_types::UsbDeviceSummary;
use async_channel::{Receiver, Sender, bounded};

/// Commands from Tokio runtime to the USB worker thread
#[derive(Debug)]
pub enum HostCommand {
    /// List all attached USB devices with their bus ids
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<UsbDeviceSummary>>,
    },

    /// Re-run device matching against the bus id registry
    ///
    /// Sent after the registry changed so newly eligible devices get bound
    /// and devices whose entry is pending removal get released.
    Rescan,

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Events from the USB worker thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A device was bound for export
    DeviceExported {
        /// Bus id of the device
        busid: String,
    },

    /// An exported device was drained and released
    DeviceReleased {
        /// Bus id of the device
        busid: String,
        /// Pooled objects returned to their caches by the drain
        objects_released: usize,
    },

    /// A registered device could not be bound
    ProbeRejected {
        /// Bus id of the device
        busid: String,
        /// Human-readable reason
        reason: String,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct HostBridge {
    cmd_tx: Sender<HostCommand>,
    event_rx: Receiver<HostEvent>,
}

impl HostBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: HostCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Queue a command without waiting for channel capacity
    ///
    /// Used from synchronous control paths; a full channel is reported
    /// rather than awaited.
    pub fn try_send_command(&self, cmd: HostCommand) -> crate::Result<()> {
        self.cmd_tx
            .try_send(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<HostEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct HostWorker {
    pub(crate) cmd_rx: Receiver<HostCommand>,
    /// Event sender (public so hot-plug callbacks can hold a clone)
    pub event_tx: Sender<HostEvent>,
}

impl HostWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<HostCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<HostCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: HostEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (HostBridge for Tokio, HostWorker for USB thread)
pub fn create_host_bridge() -> (HostBridge, HostWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(256);

    (
        HostBridge { cmd_tx, event_rx },
        HostWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_host_bridge();

        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, HostCommand::Rescan)
        });

        bridge.send_command(HostCommand::Rescan).await.unwrap();

        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_events_reach_runtime() {
        let (bridge, worker) = create_host_bridge();

        worker
            .send_event(HostEvent::DeviceExported {
                busid: "1-1".to_string(),
            })
            .unwrap();

        let event = bridge.recv_event().await.unwrap();
        assert_eq!(
            event,
            HostEvent::DeviceExported {
                busid: "1-1".to_string()
            }
        );
    }

    #[test]
    fn test_try_send_after_worker_dropped() {
        let (bridge, worker) = create_host_bridge();
        drop(worker);

        assert!(bridge.try_send_command(HostCommand::Rescan).is_err());
    }
}
