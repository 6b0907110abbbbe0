//! Coordinate transform and job admission.
//!
//! Object centers arrive in image pixel coordinates; the CAM server wants
//! stage-relative offsets from the field center plus 1-based carrier
//! indices. This module owns that conversion — flip, swap, center-relative
//! offset — together with the per-well imaging quota and the resolution of
//! which measurement supplies the object centers.
//!
//! Everything here is pure state + arithmetic; the session controller wires
//! the results into outgoing commands.

use log::{debug, trace, warn};
use std::collections::HashMap;

use crate::config::CenterSource;
use crate::error::{CamError, CamResult};
use crate::measurement::{
    MeasuredValue, MeasurementStore, F_AREASHAPE_CENTER_X, F_AREASHAPE_CENTER_Y,
    F_BOUNDINGBOX_CENTER_X, F_BOUNDINGBOX_CENTER_Y, F_LOCATION_CENTER_X, F_LOCATION_CENTER_Y,
    M_CHAMBER_U, M_CHAMBER_V, M_IMAGE_HEIGHT, M_IMAGE_WIDTH, M_POS_X, M_POS_Y, M_SLIDE,
    M_TIMEPOINT,
};
use crate::protocol::ImagingJob;

/// Axis corrections for stage coordinate systems. Flips happen before the
/// swap; the order is part of the contract.
pub fn transform(
    x: f64,
    y: f64,
    image_width: u32,
    image_height: u32,
    flip_x: bool,
    flip_y: bool,
    swap_xy: bool,
) -> (f64, f64) {
    let mut x = x;
    let mut y = y;
    if flip_x {
        x = f64::from(image_width - 1) - x;
    }
    if flip_y {
        y = f64::from(image_height - 1) - y;
    }
    if swap_xy {
        std::mem::swap(&mut x, &mut y);
    }
    (x, y)
}

/// Stage-relative pixel offset of a (transformed) object center from the
/// field center, plus the configured fixed offsets.
pub fn stage_offset(
    x: f64,
    y: f64,
    image_width: u32,
    image_height: u32,
    offset_x: i32,
    offset_y: i32,
) -> (i32, i32) {
    let dx = (x - f64::from(image_width) / 2.0).round() as i32 + offset_x;
    let dy = (y - f64::from(image_height) / 2.0).round() as i32 + offset_y;
    (dx, dy)
}

/// Where an acquisition came from, in the server's zero-based metadata
/// terms. Extracted from the image-level measurements the wait side
/// published for the current image set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldContext {
    pub slide: i32,
    pub well_u: i32,
    pub well_v: i32,
    pub field_x: i32,
    pub field_y: i32,
    pub timepoint: i32,
}

impl FieldContext {
    /// Read the context from the measurement store; any missing key is
    /// fatal for the step.
    pub fn from_store(store: &dyn MeasurementStore) -> CamResult<Self> {
        let get = |key: &str| -> CamResult<i32> {
            store
                .image_value(key)
                .and_then(|v| v.as_i32())
                .ok_or_else(|| CamError::MissingMeasurement(key.to_string()))
        };
        Ok(Self {
            slide: get(M_SLIDE)?,
            well_u: get(M_CHAMBER_U)?,
            well_v: get(M_CHAMBER_V)?,
            field_x: get(M_POS_X)?,
            field_y: get(M_POS_Y)?,
            timepoint: get(M_TIMEPOINT)?,
        })
    }
}

/// Build the job record for one object. The server counts from 1, the
/// metadata counts from 0.
pub fn build_job(
    job_name: &str,
    dx: i32,
    dy: i32,
    ctx: &FieldContext,
) -> ImagingJob {
    ImagingJob {
        job_name: job_name.to_string(),
        dx,
        dy,
        slide: ctx.slide + 1,
        well_x: ctx.well_u + 1,
        well_y: ctx.well_v + 1,
        field_x: ctx.field_x + 1,
        field_y: ctx.field_y + 1,
    }
}

/// Key of the per-well imaging quota: one counter per timepoint, well and
/// object class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WellKey {
    pub timepoint: i32,
    pub well_u: i32,
    pub well_v: i32,
    pub object_class: String,
}

/// Counts objects seen per well so that the number of high-resolution jobs
/// per well can be capped. The counter always advances — suppressed
/// objects still consume quota — and is reset at the start of a run.
#[derive(Debug, Default)]
pub struct WellQuota {
    counts: HashMap<WellKey, u32>,
}

impl WellQuota {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one object under `key` and decide whether it may be imaged.
    /// `max == -1` means unlimited.
    pub fn admit(&mut self, key: WellKey, max: i32) -> bool {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        trace!(
            "well {}/{} t{} class {}: count {}",
            key.well_u,
            key.well_v,
            key.timepoint,
            key.object_class,
            count
        );
        max == -1 || i64::from(*count) <= i64::from(max)
    }

    /// Objects seen so far under `key`.
    pub fn count(&self, key: &WellKey) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

/// Resolved object centers plus the source that actually supplied them.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectCenters {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
    pub source: CenterSource,
}

/// Pick the object centers for `object_class`.
///
/// The configured source is the entry point of an availability chain:
/// area-shape center, then bounding-box center, then plain location
/// centroid. A configured-but-missing measurement degrades to the next
/// alternative instead of failing the step; a missing location column is
/// treated as an empty object set.
pub fn resolve_centers(
    store: &dyn MeasurementStore,
    object_class: &str,
    source: CenterSource,
) -> ObjectCenters {
    let pair = |fx: &str, fy: &str| -> Option<(Vec<f64>, Vec<f64>)> {
        let xs = store.object_feature(object_class, fx)?;
        let ys = store.object_feature(object_class, fy)?;
        Some((xs, ys))
    };

    if source == CenterSource::AreaShape {
        if let Some((xs, ys)) = pair(F_AREASHAPE_CENTER_X, F_AREASHAPE_CENTER_Y) {
            debug!("using AreaShape_Center_X/Y for {object_class}");
            return ObjectCenters {
                xs,
                ys,
                source: CenterSource::AreaShape,
            };
        }
    }
    if matches!(source, CenterSource::AreaShape | CenterSource::BoundingBox) {
        if let Some((xs, ys)) = pair(F_BOUNDINGBOX_CENTER_X, F_BOUNDINGBOX_CENTER_Y) {
            debug!("using bounding-box centers for {object_class}");
            return ObjectCenters {
                xs,
                ys,
                source: CenterSource::BoundingBox,
            };
        }
    }
    match pair(F_LOCATION_CENTER_X, F_LOCATION_CENTER_Y) {
        Some((xs, ys)) => ObjectCenters {
            xs,
            ys,
            source: CenterSource::Location,
        },
        None => {
            warn!("no center measurements for {object_class}; treating as empty object set");
            ObjectCenters {
                xs: Vec::new(),
                ys: Vec::new(),
                source: CenterSource::Location,
            }
        }
    }
}

/// The object set handed over by the upstream collaborator: the class name
/// plus the shapes used as dimension fallbacks.
#[derive(Debug, Clone)]
pub struct ObjectSet {
    pub class_name: String,
    /// `(width, height)` of the image the objects were detected in, when
    /// the upstream collaborator still has it.
    pub parent_image_size: Option<(u32, u32)>,
    /// Shape of the segmentation mask; always present.
    pub mask_size: (u32, u32),
}

/// Image dimensions for the coordinate transform, as ordered alternatives:
/// the measurements published by the wait side, else the parent image's
/// shape, else the object mask's shape.
pub fn image_dimensions(store: &dyn MeasurementStore, objects: &ObjectSet) -> (u32, u32) {
    let measured = |key: &str| -> Option<u32> {
        match store.image_value(key) {
            Some(MeasuredValue::Int(v)) => u32::try_from(v).ok(),
            _ => None,
        }
    };
    if let (Some(w), Some(h)) = (measured(M_IMAGE_WIDTH), measured(M_IMAGE_HEIGHT)) {
        return (w, h);
    }
    if let Some(size) = objects.parent_image_size {
        debug!("no image measurements; using parent image shape {size:?}");
        return size;
    }
    debug!(
        "no image measurements or parent image; using mask shape {:?}",
        objects.mask_size
    );
    objects.mask_size
}
