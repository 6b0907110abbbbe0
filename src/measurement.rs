//! Boundary to the host pipeline's measurement store.
//!
//! The bridge never owns object measurements; it reads per-object features
//! (center coordinates) and writes image-level values (parsed filename
//! metadata, output file names) through this trait. The in-memory
//! implementation backs the tests and the stand-alone CLI.

use std::collections::HashMap;

/// Feature names consumed for object centers.
pub const F_LOCATION_CENTER_X: &str = "Location_Center_X";
pub const F_LOCATION_CENTER_Y: &str = "Location_Center_Y";
pub const F_AREASHAPE_CENTER_X: &str = "AreaShape_Center_X";
pub const F_AREASHAPE_CENTER_Y: &str = "AreaShape_Center_Y";
pub const F_BOUNDINGBOX_CENTER_X: &str = "AreaShape_Boundingbox_X_Centre";
pub const F_BOUNDINGBOX_CENTER_Y: &str = "AreaShape_Boundingbox_Y_Centre";

/// Image-level keys published after each acquisition.
pub const M_IMAGE_WIDTH: &str = "Metadata_image_width";
pub const M_IMAGE_HEIGHT: &str = "Metadata_image_height";
pub const M_POS_X: &str = "Metadata_PosX";
pub const M_POS_Y: &str = "Metadata_PosY";
pub const M_SLIDE: &str = "Metadata_Slide";
pub const M_CHAMBER_U: &str = "Metadata_ChamberU";
pub const M_CHAMBER_V: &str = "Metadata_ChamberV";
pub const M_CHAMBER_M: &str = "Metadata_M";
pub const M_LOOP: &str = "Metadata_Loop";
pub const M_Z_POS: &str = "Metadata_Zpos";
pub const M_OTHER: &str = "Metadata_Other";
pub const M_JOB: &str = "Metadata_Job";
pub const M_CHANNEL: &str = "Metadata_Channel";
pub const M_TIMEPOINT: &str = "Metadata_T";

/// Key under which an output image's file name is published.
pub fn file_name_key(output_name: &str) -> String {
    format!("FileName_{output_name}")
}

/// Key under which an output image's directory is published.
pub fn path_name_key(output_name: &str) -> String {
    format!("PathName_{output_name}")
}

/// An image-level measurement value.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasuredValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MeasuredValue {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            MeasuredValue::Int(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MeasuredValue::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// Read/write access to the host's measurements for the current image set.
pub trait MeasurementStore: Send {
    /// Per-object feature values for one object class, or `None` when the
    /// feature has not been computed.
    fn object_feature(&self, object_class: &str, feature: &str) -> Option<Vec<f64>>;

    /// Image-level value previously published for the current image set.
    fn image_value(&self, key: &str) -> Option<MeasuredValue>;

    /// Publish an image-level value, overwriting any previous one.
    fn set_image_value(&mut self, key: &str, value: MeasuredValue);
}

/// Simple map-backed store used by tests and the CLI.
#[derive(Debug, Default)]
pub struct InMemoryMeasurements {
    objects: HashMap<(String, String), Vec<f64>>,
    image: HashMap<String, MeasuredValue>,
}

impl InMemoryMeasurements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a per-object feature column.
    pub fn insert_object_feature(
        &mut self,
        object_class: &str,
        feature: &str,
        values: Vec<f64>,
    ) {
        self.objects
            .insert((object_class.to_string(), feature.to_string()), values);
    }
}

impl MeasurementStore for InMemoryMeasurements {
    fn object_feature(&self, object_class: &str, feature: &str) -> Option<Vec<f64>> {
        self.objects
            .get(&(object_class.to_string(), feature.to_string()))
            .cloned()
    }

    fn image_value(&self, key: &str) -> Option<MeasuredValue> {
        self.image.get(key).cloned()
    }

    fn set_image_value(&mut self, key: &str, value: MeasuredValue) {
        self.image.insert(key.to_string(), value);
    }
}
