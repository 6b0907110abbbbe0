//! Stand-alone CLI for operating the CAM bridge without a host pipeline:
//! watch acquisitions as the server reports them, submit a single job, or
//! clear the server-side queue. Useful for commissioning a microscope
//! before wiring the bridge into an analysis pipeline.

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use camlink::protocol::{CamCommand, ImagingJob};
use camlink::{CamClient, Settings};

#[derive(Parser)]
#[command(name = "camlink", about = "Bridge to a microscope CAM server")]
struct Cli {
    /// Path to a TOML settings file (defaults to ./camlink.toml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for acquisition notifications and print their metadata.
    Watch {
        /// Stop after this many images (0 = run until interrupted).
        #[arg(long, default_value_t = 0)]
        count: u32,
        /// Print parsed metadata as JSON instead of the summary line.
        #[arg(long)]
        json: bool,
        /// Drain stale notifications before the first wait.
        #[arg(long)]
        flush: bool,
    },
    /// Queue one imaging job and start the scan.
    Submit {
        /// CAM job name to invoke.
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 0)]
        dx: i32,
        #[arg(long, default_value_t = 0)]
        dy: i32,
        /// 1-based carrier indices, as the server expects them.
        #[arg(long, default_value_t = 1)]
        slide: i32,
        #[arg(long, default_value_t = 1)]
        well_x: i32,
        #[arg(long, default_value_t = 1)]
        well_y: i32,
        #[arg(long, default_value_t = 1)]
        field_x: i32,
        #[arg(long, default_value_t = 1)]
        field_y: i32,
        /// Also send start-scan after queueing.
        #[arg(long)]
        start: bool,
    },
    /// Clear the server-side job queue.
    Clear,
    /// Send the start-scan command.
    StartScan,
    /// Tell the server to stop waiting for job submissions.
    StopWaiting,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings =
        Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(level) = &settings.log_level {
        builder.parse_filters(level);
    }
    builder.init();

    let mut client = CamClient::from_settings(&settings.server);
    client
        .connect()
        .await
        .context("cannot reach the CAM server")?;

    match cli.command {
        Command::Watch { count, json, flush } => {
            if flush || settings.server.flush_on_start {
                let drained = client.flush_pending().await?;
                info!("flushed {drained} stale message(s)");
            }
            let mut seen = 0u32;
            loop {
                let (filename, metadata) = client
                    .wait_for_image(
                        settings.acquisition.job_of_interest,
                        settings.server.wait_timeout,
                    )
                    .await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&metadata)?);
                } else {
                    println!(
                        "{filename}  well U{:02}/V{:02}  field X{:02}/Y{:02}  T{} Z{} C{} (job {})",
                        metadata.chamber_u.value(),
                        metadata.chamber_v.value(),
                        metadata.x.value(),
                        metadata.y.value(),
                        metadata.timepoint.value(),
                        metadata.z.value(),
                        metadata.channel.value(),
                        metadata.job.value(),
                    );
                }
                seen += 1;
                if count > 0 && seen >= count {
                    break;
                }
            }
        }
        Command::Submit {
            job,
            dx,
            dy,
            slide,
            well_x,
            well_y,
            field_x,
            field_y,
            start,
        } => {
            let job = ImagingJob {
                job_name: job.unwrap_or_else(|| settings.dispatch.cam_job.clone()),
                dx,
                dy,
                slide,
                well_x,
                well_y,
                field_x,
                field_y,
            };
            client.send_command(&CamCommand::AddJob(job)).await?;
            if start {
                client.send_command(&CamCommand::StartScan).await?;
            }
            info!("job queued");
        }
        Command::Clear => {
            client.send_command(&CamCommand::DeleteList).await?;
            info!("job queue cleared");
        }
        Command::StartScan => {
            client.send_command(&CamCommand::StartScan).await?;
        }
        Command::StopWaiting => {
            client.send_command(&CamCommand::StopWaiting).await?;
        }
    }

    client.disconnect();
    Ok(())
}
