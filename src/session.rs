//! Per-step orchestration of a CAM session.
//!
//! The host pipeline calls [`SessionController::run_step`] once per
//! processing step: the controller makes sure the connection is up, waits
//! for the image of interest, assembles one stack per configured channel
//! and publishes the results and the parsed metadata to the measurement
//! store. In the opposite direction, [`SessionController::dispatch_objects`]
//! turns detected objects into queued high-resolution jobs.
//!
//! The controller is the single owner of the [`CamClient`], the well quota
//! and the step counter; nothing here is shared global state. Calls are
//! serialized by the host (one step at a time), so no internal locking is
//! needed.

use log::{debug, info, warn};
use std::path::{Path, PathBuf};

use crate::client::CamClient;
use crate::config::{CommandPolicy, Settings};
use crate::dispatch::{
    build_job, image_dimensions, resolve_centers, stage_offset, transform, FieldContext,
    ObjectSet, WellKey, WellQuota,
};
use crate::error::CamResult;
use crate::filename::FilenameMetadata;
use crate::measurement::{
    file_name_key, path_name_key, MeasuredValue, MeasurementStore, M_CHAMBER_M, M_CHAMBER_U,
    M_CHAMBER_V, M_CHANNEL, M_IMAGE_HEIGHT, M_IMAGE_WIDTH, M_JOB, M_LOOP, M_OTHER, M_POS_X,
    M_POS_Y, M_SLIDE, M_TIMEPOINT, M_Z_POS,
};
use crate::protocol::CamCommand;
use crate::stack::{assemble, ImageRead, SliceImage, StackRequest};

/// One per-channel image produced by a step, with the names under which it
/// was published.
#[derive(Debug, Clone)]
pub struct AcquiredImage {
    pub output_name: String,
    pub file_name: String,
    pub path_name: PathBuf,
    pub image: SliceImage,
}

/// Everything a completed step hands back to the host.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// The filename exactly as the server announced it.
    pub filename: String,
    pub metadata: FilenameMetadata,
    pub images: Vec<AcquiredImage>,
}

/// Outcome of one object-dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub objects_seen: usize,
    pub jobs_queued: usize,
    pub suppressed: usize,
}

/// Drives the protocol client, stack assembler and job dispatcher through
/// one acquisition session.
pub struct SessionController<R: ImageRead> {
    settings: Settings,
    client: CamClient,
    reader: R,
    quota: WellQuota,
    steps_completed: u32,
}

impl<R: ImageRead> SessionController<R> {
    pub fn new(settings: Settings, reader: R) -> CamResult<Self> {
        settings.validate()?;
        let client = CamClient::from_settings(&settings.server);
        Ok(Self {
            settings,
            client,
            reader,
            quota: WellQuota::new(),
            steps_completed: 0,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client(&self) -> &CamClient {
        &self.client
    }

    pub fn steps_completed(&self) -> u32 {
        self.steps_completed
    }

    /// Whether the configured number of image sets has been processed.
    pub fn is_complete(&self) -> bool {
        self.steps_completed >= self.settings.acquisition.image_sets
    }

    /// One reconnect attempt when the connection is down; a failure
    /// propagates to the host.
    async fn ensure_connected(&mut self) -> CamResult<()> {
        if !self.client.is_connected() {
            warn!("not connected to CAM server, attempting reconnect");
            self.client.connect().await?;
        }
        Ok(())
    }

    /// Wait for the next image of interest and read it back, one image per
    /// configured channel.
    pub async fn run_step(&mut self, store: &mut dyn MeasurementStore) -> CamResult<StepResult> {
        if self.steps_completed == 0 {
            // A fresh run must not inherit the previous run's socket state
            // or duplicate tracker.
            info!("first image of analysis run, recycling connection");
            self.client.disconnect();
            self.client.connect().await?;
            self.client.reset_duplicate_tracker();
            self.quota.reset();
        } else {
            self.ensure_connected().await?;
        }

        if self.settings.server.flush_on_start {
            self.client.flush_pending().await?;
        }

        let (filename, metadata) = self
            .client
            .wait_for_image(
                self.settings.acquisition.job_of_interest,
                self.settings.server.wait_timeout,
            )
            .await?;
        debug!("waited image: {filename}");

        let last_slice = metadata.z.value();
        let mut images = Vec::with_capacity(self.settings.acquisition.channels.len());
        for channel in &self.settings.acquisition.channels {
            // The operator counts channels from 1, the filename from 0.
            let channel_md = metadata.with_channel(i32::from(channel.number) - 1);
            let request = StackRequest {
                metadata: channel_md.clone(),
                last_slice,
                mode: self.settings.acquisition.stack_mode,
            };
            info!("reading {} for output '{}'", channel_md.encode(), channel.output_name);
            let image =
                assemble(&self.reader, &self.settings.acquisition.base_path, &request).await?;

            let full_path = self.settings.acquisition.base_path.join(channel_md.encode());
            let file_name = full_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| channel_md.encode());
            let path_name = full_path.parent().map(Path::to_path_buf).unwrap_or_default();

            store.set_image_value(
                &file_name_key(&channel.output_name),
                MeasuredValue::Text(file_name.clone()),
            );
            store.set_image_value(
                &path_name_key(&channel.output_name),
                MeasuredValue::Text(path_name.display().to_string()),
            );
            images.push(AcquiredImage {
                output_name: channel.output_name.clone(),
                file_name,
                path_name,
                image,
            });
        }

        if let Some(primary) = images.first() {
            publish_image_metadata(store, &metadata, primary.image.width, primary.image.height);
        }

        self.steps_completed += 1;
        Ok(StepResult {
            filename,
            metadata,
            images,
        })
    }

    /// Queue one imaging job per admitted object, then apply the start-scan
    /// and stop-waiting policies.
    pub async fn dispatch_objects(
        &mut self,
        store: &mut dyn MeasurementStore,
        objects: &ObjectSet,
    ) -> CamResult<DispatchSummary> {
        self.ensure_connected().await?;
        let dispatch = self.settings.dispatch.clone();

        // Clear the server-side queue even when no object was found, so a
        // stale queue is never imaged again.
        if dispatch.delete_list {
            self.client.send_command(&CamCommand::DeleteList).await?;
        }

        let centers = resolve_centers(store, &objects.class_name, dispatch.center_source);
        let mut summary = DispatchSummary {
            objects_seen: centers.xs.len(),
            ..DispatchSummary::default()
        };

        if centers.xs.is_empty() {
            info!("no objects in current image set");
        } else {
            let (width, height) = image_dimensions(store, objects);
            let ctx = FieldContext::from_store(store)?;
            for (&x, &y) in centers.xs.iter().zip(&centers.ys) {
                let (tx, ty) = transform(
                    x,
                    y,
                    width,
                    height,
                    dispatch.flip_x,
                    dispatch.flip_y,
                    dispatch.swap_xy,
                );
                let (dx, dy) =
                    stage_offset(tx, ty, width, height, dispatch.offset_x, dispatch.offset_y);
                let key = WellKey {
                    timepoint: ctx.timepoint,
                    well_u: ctx.well_u,
                    well_v: ctx.well_v,
                    object_class: objects.class_name.clone(),
                };
                if self.quota.admit(key, dispatch.max_objects_per_well) {
                    let job = build_job(&dispatch.cam_job, dx, dy, &ctx);
                    self.client.send_command(&CamCommand::AddJob(job)).await?;
                    summary.jobs_queued += 1;
                } else {
                    debug!("well quota reached, not queueing object at ({x}, {y})");
                    summary.suppressed += 1;
                }
            }
        }

        if dispatch.start_scan == CommandPolicy::Immediate {
            self.client.send_command(&CamCommand::StartScan).await?;
        }
        if dispatch.stop_waiting == CommandPolicy::Immediate {
            self.client.send_command(&CamCommand::StopWaiting).await?;
        }
        Ok(summary)
    }

    /// Issue deferred session-boundary commands, then close the connection.
    pub async fn finish_run(&mut self) -> CamResult<()> {
        let start_deferred = self.settings.dispatch.start_scan == CommandPolicy::Deferred;
        let stop_deferred = self.settings.dispatch.stop_waiting == CommandPolicy::Deferred;
        if start_deferred || stop_deferred {
            self.ensure_connected().await?;
            if start_deferred {
                self.client.send_command(&CamCommand::StartScan).await?;
            }
            if stop_deferred {
                self.client.send_command(&CamCommand::StopWaiting).await?;
            }
        }
        self.client.disconnect();
        info!("analysis run finished after {} step(s)", self.steps_completed);
        Ok(())
    }
}

/// Publish the integer metadata fields of one acquisition for downstream
/// consumption (export, job dispatch).
pub fn publish_image_metadata(
    store: &mut dyn MeasurementStore,
    metadata: &FilenameMetadata,
    width: u32,
    height: u32,
) {
    let values: [(&str, i64); 14] = [
        (M_IMAGE_WIDTH, i64::from(width)),
        (M_IMAGE_HEIGHT, i64::from(height)),
        (M_POS_X, i64::from(metadata.x.value())),
        (M_POS_Y, i64::from(metadata.y.value())),
        (M_SLIDE, i64::from(metadata.slide.value())),
        (M_CHAMBER_U, i64::from(metadata.chamber_u.value())),
        (M_CHAMBER_V, i64::from(metadata.chamber_v.value())),
        (M_CHAMBER_M, i64::from(metadata.chamber_m.value())),
        (M_LOOP, i64::from(metadata.loop_index.value())),
        (M_Z_POS, i64::from(metadata.z.value())),
        (M_OTHER, i64::from(metadata.other.value())),
        (M_JOB, i64::from(metadata.job.value())),
        (M_CHANNEL, i64::from(metadata.channel.value())),
        (M_TIMEPOINT, i64::from(metadata.timepoint.value())),
    ];
    for (key, value) in values {
        store.set_image_value(key, MeasuredValue::Int(value));
    }
}
