//! Event system for UI decoupling.
//!
//! Allows CLI/GUI frontends to subscribe to session events without tight
//! coupling to the flashing logic.

use std::fmt;

/// Flashing session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for an EDL device to enumerate.
    WaitingForDevice,
    /// Loader authentication handshake.
    Authenticating,
    /// Storage configuration negotiation.
    Configuring,
    /// Ready for transfer commands.
    Idle,
    /// Writing image data to the device.
    Flashing,
    /// Reading partition data back from the device.
    Reading,
    /// Erasing a partition.
    Erasing,
    /// Applying patch commands.
    Patching,
    /// Device is rebooting or powering off.
    Resetting,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::WaitingForDevice => write!(f, "Waiting for Device"),
            SessionPhase::Authenticating => write!(f, "Authenticating"),
            SessionPhase::Configuring => write!(f, "Configuring"),
            SessionPhase::Idle => write!(f, "Idle"),
            SessionPhase::Flashing => write!(f, "Flashing"),
            SessionPhase::Reading => write!(f, "Reading"),
            SessionPhase::Erasing => write!(f, "Erasing"),
            SessionPhase::Patching => write!(f, "Patching"),
            SessionPhase::Resetting => write!(f, "Resetting"),
            SessionPhase::Complete => write!(f, "Complete"),
            SessionPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the flashing session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Device connected.
    DeviceConnected { vid: u16, pid: u16 },
    /// Device disconnected.
    DeviceDisconnected,
    /// Phase changed.
    PhaseChanged { from: SessionPhase, to: SessionPhase },
    /// Progress update for the current transfer. `current`/`total` are bytes.
    Progress {
        phase: SessionPhase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// A `<log>` line the loader pushed.
    DeviceLog { message: String },
    /// One partition finished flashing.
    PartitionComplete { label: String, bytes: u64 },
    /// Error occurred.
    Error { message: String },
    /// All operations completed successfully.
    Complete,
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait SessionObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &SessionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_event(&self, _event: &SessionEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            SessionEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            SessionEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            SessionEvent::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(phase = %phase, operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            SessionEvent::DeviceLog { message } => {
                tracing::debug!(device = %message, "Device log");
            }
            SessionEvent::PartitionComplete { label, bytes } => {
                tracing::info!(label = %label, bytes = bytes, "Partition complete");
            }
            SessionEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            SessionEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}
