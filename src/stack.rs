//! Z-stack assembly.
//!
//! Given the metadata of a reported acquisition, the assembler loads each
//! slice of the stack through the external [`ImageRead`] collaborator and
//! reduces the stack to a single 2D image: pass-through for single-slice
//! acquisitions, mean or max projection otherwise. Sibling slice filenames
//! are derived through the codec by substituting only the Z token, so every
//! other token stays byte-identical to the reported name.
//!
//! Image decoding itself lives outside this crate; anything that yields
//! pixel data and an intensity scale for a path can implement [`ImageRead`].

use async_trait::async_trait;
use log::{debug, trace};
use std::path::{Path, PathBuf};

use crate::config::StackMode;
use crate::error::{CamError, CamResult};
use crate::filename::FilenameMetadata;

/// One decoded image plane: row-major `f64` samples plus the intensity
/// scale (maximum representable value) of the source data.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<f64>,
    pub scale: f64,
}

impl SliceImage {
    /// Pixel count sanity check; readers are expected to uphold this.
    pub fn is_consistent(&self) -> bool {
        self.pixels.len() == (self.width as usize) * (self.height as usize)
    }
}

/// External image-reader collaborator.
#[async_trait]
pub trait ImageRead: Send + Sync {
    /// Decode the file at `path` into pixel data and its intensity scale.
    async fn read(&self, path: &Path) -> CamResult<SliceImage>;
}

/// One stack to assemble: the per-channel metadata of the reported file,
/// the inclusive top slice index, and the reduction mode.
#[derive(Debug, Clone)]
pub struct StackRequest {
    pub metadata: FilenameMetadata,
    /// Z range is `0..=last_slice`; the reported acquisition carries the
    /// top slice index in its Z token.
    pub last_slice: i32,
    pub mode: StackMode,
}

impl StackRequest {
    /// Path of the slice at `z`, resolved under `base_path`.
    fn slice_path(&self, base_path: &Path, z: i32) -> PathBuf {
        base_path.join(self.metadata.with_z(z).encode())
    }
}

/// Load and reduce one stack.
///
/// `None` reads exactly the reported file and returns pixels and scale
/// unmodified. `Mean` accumulates pixel sums and the sum of slice scales,
/// then divides by the accumulated scale. `Max` keeps the element-wise
/// maximum and divides by the first slice's scale, which it also reports.
/// Any slice failure is fatal to the whole request; no partial image is
/// ever returned.
pub async fn assemble(
    reader: &dyn ImageRead,
    base_path: &Path,
    request: &StackRequest,
) -> CamResult<SliceImage> {
    if request.mode == StackMode::None {
        let path = base_path.join(request.metadata.encode());
        trace!("reading single slice {}", path.display());
        return reader.read(&path).await;
    }

    let mut assembled: Option<SliceImage> = None;
    let mut accumulated_scale = 0.0;

    for z in 0..=request.last_slice {
        let path = request.slice_path(base_path, z);
        trace!("reading slice {z} from {}", path.display());
        let slice = reader.read(&path).await?;

        match assembled.as_mut() {
            None => {
                debug!(
                    "stack {}: {}x{} pixels, scale {}",
                    request.metadata.encode(),
                    slice.width,
                    slice.height,
                    slice.scale
                );
                accumulated_scale = slice.scale;
                assembled = Some(slice);
            }
            Some(acc) => {
                if slice.width != acc.width || slice.height != acc.height {
                    return Err(CamError::Read {
                        path: path.display().to_string(),
                        reason: format!(
                            "slice shape {}x{} differs from first slice {}x{}",
                            slice.width, slice.height, acc.width, acc.height
                        ),
                    });
                }
                match request.mode {
                    StackMode::Mean => {
                        for (dst, src) in acc.pixels.iter_mut().zip(&slice.pixels) {
                            *dst += src;
                        }
                        accumulated_scale += slice.scale;
                    }
                    StackMode::Max => {
                        for (dst, src) in acc.pixels.iter_mut().zip(&slice.pixels) {
                            *dst = dst.max(*src);
                        }
                    }
                    StackMode::None => unreachable!("handled above"),
                }
            }
        }
    }

    let mut image = assembled.ok_or_else(|| CamError::Read {
        path: request.slice_path(base_path, 0).display().to_string(),
        reason: "stack contains no slices".to_string(),
    })?;

    // Mean divides by the accumulated scale; max by the first slice's.
    let divisor = accumulated_scale;
    for px in &mut image.pixels {
        *px /= divisor;
    }
    image.scale = divisor;
    Ok(image)
}
