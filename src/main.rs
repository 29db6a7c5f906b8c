use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use lid_powerd::events::DaemonEvent;
use lid_powerd::platform::drm_power::DrmPowerDevice;
use lid_powerd::platform::lid_switch;
use lid_powerd::power::{PowerEngine, PowerOutcome, SessionFallback};
use lid_powerd::xorg::helper;

const DRM_DEVICE: &str = "/dev/dri/card0";
const INPUT_DIR: &str = "/dev/input";
const PROC_ROOT: &str = "/proc";

#[derive(Debug, Parser)]
#[command(
    name = "lid-powerd",
    version,
    about = "lid-switch display power daemon"
)]
struct Args {
    /// Force displays off, wait N seconds, force them back on, then exit
    #[arg(long = "power-test", value_name = "SECONDS")]
    power_test: Option<u64>,
    #[command(subcommand)]
    command: Option<HelperCommand>,
}

#[derive(Debug, Subcommand)]
enum HelperCommand {
    /// Connect to the X session named by DISPLAY and force its DPMS level
    #[command(name = "x11-dpms", hide = true)]
    X11Dpms {
        #[arg(value_parser = ["on", "off"])]
        level: String,
    },
}

fn main() -> Result<()> {
    let Args {
        power_test,
        command,
    } = Args::parse();

    // Helper mode first: its stderr belongs to the parent's diagnostic
    // capture, so no subscriber is installed on this path.
    if let Some(HelperCommand::X11Dpms { level }) = command {
        std::process::exit(helper::run(level == "on"));
    }

    // init tracing (RUST_LOG controls level, default = info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let direct = DrmPowerDevice::open(Path::new(DRM_DEVICE))
        .context("failed to initialize the display controller")?;
    let mut engine = PowerEngine::new(direct, SessionFallback::new(PROC_ROOT));

    if let Some(seconds) = power_test {
        return run_power_test(&mut engine, seconds);
    }

    let device = lid_switch::find_lid_device(Path::new(INPUT_DIR))
        .ok_or_else(|| anyhow!("no lid switch device found under {INPUT_DIR}"))?;

    let (event_tx, event_rx) = bounded::<DaemonEvent>(16);

    {
        let event_tx = event_tx.clone();
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("failed to install signal handlers")?;
        thread::spawn(move || {
            if signals.forever().next().is_some() {
                let _ = event_tx.send(DaemonEvent::Shutdown);
            }
        });
    }
    thread::spawn(move || lid_switch::watch(device, event_tx));

    // One transition at a time: the next event is not read until the engine
    // has run the previous one to completion.
    for event in event_rx {
        match event {
            DaemonEvent::Lid(lid) => {
                let on = lid.display_power_on();
                let outcome = engine.set_power(on);
                log_outcome(on, &outcome);
            }
            DaemonEvent::InputClosed => {
                tracing::info!("lid switch input closed; exiting");
                break;
            }
            DaemonEvent::Shutdown => {
                tracing::info!("shutdown signal received; exiting");
                break;
            }
        }
    }

    Ok(())
}

fn log_outcome(on: bool, outcome: &PowerOutcome) {
    match outcome {
        PowerOutcome::Direct => {
            tracing::info!(on, "power state written to the display controller");
        }
        PowerOutcome::Session { display: display_name } => {
            tracing::info!(on, display = %display_name, "power state accepted by the display server");
        }
        PowerOutcome::Unhandled => {
            tracing::debug!(on, "no display path accepted the power change");
        }
    }
}

fn run_power_test(engine: &mut PowerEngine<DrmPowerDevice>, seconds: u64) -> Result<()> {
    tracing::info!(duration = seconds, "power-test: forcing displays off");
    let off = engine.set_power(false);
    log_outcome(false, &off);

    thread::sleep(Duration::from_secs(seconds));

    tracing::info!("power-test: forcing displays back on");
    let on = engine.set_power(true);
    log_outcome(true, &on);
    if on == PowerOutcome::Unhandled {
        bail!("power test reached no display path");
    }
    Ok(())
}
