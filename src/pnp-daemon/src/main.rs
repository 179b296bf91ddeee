// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! pnpd - pick-and-place dispense controller daemon.
//!
//! Loads a machine profile, connects to the controller over serial, homes
//! the machine, and optionally runs a dispense job to completion. Ctrl-C
//! aborts a running job at the next unit boundary and cleans up.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use clap::Parser;
use tokio::signal;
use tracing::{debug, info, warn};

use pnp_core::driver::MachineDriver;
use pnp_core::geom::Location;
use pnp_core::transport::open_serial;
use pnp_core::vision::FiducialLocator;
use pnp_core::DynResult;
use pnp_job::dispense::DispenseJobProcessor;

mod config;

use config::{load_job, Profile};

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - pick-and-place dispense daemon");

#[derive(Debug, Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = PKG_DESCRIPTION)]
struct Cli {
    /// Machine profile (TOML)
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: PathBuf,
    /// Dispense job to run (JSON); without one the daemon connects, homes,
    /// and idles until interrupted
    #[arg(short = 'j', long = "job", value_name = "PATH")]
    job: Option<PathBuf>,
    /// Do not home after connecting
    #[arg(long)]
    skip_home: bool,
}

/// Stand-in for the vision system: reports every feature exactly at its
/// nominal pose. Machines with a camera replace this with a real locator.
struct NominalLocator;

impl FiducialLocator for NominalLocator {
    fn locate<'a>(
        &'a mut self,
        nominal: Location,
        feature: &'a str,
    ) -> Pin<Box<dyn Future<Output = DynResult<Location>> + Send + 'a>> {
        debug!("no vision fitted; feature {feature} assumed at nominal pose");
        Box::pin(async move { Ok(nominal) })
    }
}

fn init_tracing(level: Option<&str>) {
    let level = level
        .and_then(|l| l.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let cli = Cli::parse();

    let profile = Profile::load(&cli.config)?;
    init_tracing(profile.general.log_level.as_deref());
    profile.validate()?;

    let port = profile
        .serial
        .port
        .clone()
        .ok_or("no serial port configured in profile")?;
    info!("starting pnpd (serial: {} @ {} baud)", port, profile.serial.baud);

    let mut gcode = profile.build_driver()?;
    gcode.set_fiducial_locator(Box::new(NominalLocator));

    let (reader, writer) = open_serial(&port, profile.serial.baud)?;
    gcode.connect(reader, writer).await?;
    gcode.set_enabled(true).await?;

    let head = profile.head_device()?;
    if !cli.skip_home {
        info!("homing");
        gcode.home(&head).await?;
    }

    let mut driver: Box<dyn MachineDriver> = Box::new(gcode);
    let result = match &cli.job {
        Some(job_path) => {
            let job = load_job(job_path)?;
            let dispenser = profile.dispenser_device()?;
            info!(
                "running job {} ({} boards)",
                job_path.display(),
                job.board_locations.len()
            );
            let mut processor = DispenseJobProcessor::new(
                driver,
                Box::new(NominalLocator),
                head,
                dispenser,
                profile.dispense_settings(),
            );
            let run = run_job(&mut processor, job).await;
            driver = processor.into_driver();
            run
        }
        None => {
            info!("no job given; idling until interrupted");
            let _ = signal::ctrl_c().await;
            Ok(())
        }
    };

    driver.set_enabled(false).await?;
    driver.close().await?;
    result
}

/// Drive the processor until the job reports completion or the operator
/// interrupts. An interrupt aborts at the next unit boundary.
async fn run_job(processor: &mut DispenseJobProcessor, job: pnp_job::model::Job) -> DynResult<()> {
    processor.initialize(job).await?;
    loop {
        tokio::select! {
            more = processor.next() => {
                if !more? {
                    info!("job finished");
                    return Ok(());
                }
            }
            _ = signal::ctrl_c() => {
                warn!("interrupted; aborting job");
                processor.abort().await?;
                return Ok(());
            }
        }
    }
}
