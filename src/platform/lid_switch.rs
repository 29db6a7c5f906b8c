use std::io::ErrorKind;
use std::path::Path;

use crossbeam_channel::Sender;
use evdev::{Device, InputEventKind, SwitchType};
use tracing::{debug, info};

use crate::events::{DaemonEvent, LidEvent};
use crate::scan;

/// Device name the kernel gives the ACPI lid switch.
pub const LID_SWITCH_NAME: &str = "Lid Switch";

/// Find the first `event*` node under `input_dir` whose device name is the
/// lid switch. Nodes we cannot open (not ours, vanished) are skipped.
pub fn find_lid_device(input_dir: &Path) -> Option<Device> {
    scan::first_match(input_dir, |path| {
        let name = path.file_name()?.to_str()?;
        if !name.starts_with("event") {
            return None;
        }
        let device = Device::open(path).ok()?;
        if device.name() == Some(LID_SWITCH_NAME) {
            info!(device = %path.display(), "lid switch found");
            Some(device)
        } else {
            None
        }
    })
}

/// Blocking read loop: translate `SW_LID` transitions into events for the
/// main loop. Ends (after reporting `InputClosed`) when the device goes away;
/// other switch events on the same device are ignored.
pub fn watch(mut device: Device, events: Sender<DaemonEvent>) {
    loop {
        match device.fetch_events() {
            Ok(batch) => {
                for event in batch {
                    let InputEventKind::Switch(switch) = event.kind() else {
                        continue;
                    };
                    if switch != SwitchType::SW_LID {
                        continue;
                    }
                    let lid = LidEvent::from_switch_value(event.value());
                    debug!(?lid, "lid transition");
                    if events.send(DaemonEvent::Lid(lid)).is_err() {
                        return;
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                info!(error = %err, "lid switch device closed");
                let _ = events.send(DaemonEvent::InputClosed);
                return;
            }
        }
    }
}
