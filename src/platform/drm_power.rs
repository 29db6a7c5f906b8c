use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use anyhow::{Context, Result};
use drm::Device;
use drm::control::{Device as ControlDevice, connector, property};
use tracing::{debug, warn};

use crate::power::{DirectAttempt, DirectPower};

const DPMS_PROPERTY: &str = "DPMS";
// Enumerated property values: 0 = on, 3 = off (1/2 are the standby levels).
const DPMS_ON: u64 = 0;
const DPMS_OFF: u64 = 3;

#[derive(Debug)]
struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

/// One video output of the card with its power property, located once at
/// open time. The property layout does not change while we run, so a missing
/// handle stays missing.
#[derive(Debug)]
struct OutputSlot {
    connector: connector::Handle,
    dpms: Option<property::Handle>,
}

/// Direct control of the display controller, used whenever no other session
/// holds the device.
#[derive(Debug)]
pub struct DrmPowerDevice {
    card: Card,
    outputs: Vec<OutputSlot>,
}

impl DrmPowerDevice {
    /// Open the card node read/write and enumerate its connectors. Failure
    /// here is fatal for the daemon; there is nothing to fall back to without
    /// the device.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open DRM device {}", path.display()))?;
        let card = Card(file);
        // The first client to open the node may hold master implicitly.
        let _ = card.release_master_lock();

        let resources = card
            .resource_handles()
            .with_context(|| format!("failed to read DRM resources of {}", path.display()))?;
        let outputs: Vec<OutputSlot> = resources
            .connectors()
            .iter()
            .map(|&conn| OutputSlot {
                connector: conn,
                dpms: find_dpms_property(&card, conn),
            })
            .collect();
        debug!(
            outputs = outputs.len(),
            with_dpms = outputs.iter().filter(|o| o.dpms.is_some()).count(),
            "DRM device initialized"
        );
        Ok(Self { card, outputs })
    }
}

fn find_dpms_property(card: &Card, conn: connector::Handle) -> Option<property::Handle> {
    let props = card.get_properties(conn).ok()?;
    for (&handle, _) in props.iter() {
        if let Ok(info) = card.get_property(handle) {
            if info.name().to_str() == Ok(DPMS_PROPERTY) {
                return Some(handle);
            }
        }
    }
    None
}

impl DirectPower for DrmPowerDevice {
    /// Master could be acquired: write the power level to every connected
    /// output that exposes the property, tolerating individual failures, and
    /// report `Applied`. Master held elsewhere is the expected steady state
    /// under a running session and reports `Unavailable`.
    fn try_set_power(&mut self, on: bool) -> DirectAttempt {
        if self.card.acquire_master_lock().is_err() {
            return DirectAttempt::Unavailable;
        }
        let value = if on { DPMS_ON } else { DPMS_OFF };
        for slot in &self.outputs {
            let Some(dpms) = slot.dpms else { continue };
            match self.card.get_connector(slot.connector, false) {
                Ok(info) if info.state() == connector::State::Connected => {
                    if let Err(err) = self.card.set_property(slot.connector, dpms, value) {
                        warn!(connector = ?slot.connector, error = %err, "failed to set DPMS property");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(connector = ?slot.connector, error = %err, "connector probe failed");
                }
            }
        }
        if let Err(err) = self.card.release_master_lock() {
            warn!(error = %err, "failed to release DRM master");
        }
        DirectAttempt::Applied
    }
}
