//! Shared helpers for reading and writing frame directories.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use walkdir::WalkDir;

use crate::error::StageError;

/// Subdirectory holding the frames of an annotated dataset.
pub const IMAGES_DIR: &str = "images";
/// Subdirectory holding one caption file per frame.
pub const CAPTIONS_DIR: &str = "captions";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// A frame found under a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Location on disk.
    pub path: PathBuf,
    /// Name unique within the tree once flattened (`a/b.png` -> `a_b.png`).
    pub flat_name: String,
}

impl Frame {
    /// File name without extension of the flattened name.
    pub fn stem(&self) -> &str {
        Path::new(&self.flat_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.flat_name)
    }
}

/// Fails with [`StageError::MissingInput`] if `input` does not exist.
pub fn ensure_input(input: &Path) -> Result<(), StageError> {
    if input.exists() {
        Ok(())
    } else {
        Err(StageError::MissingInput(input.to_path_buf()))
    }
}

/// Returns `dir/images` if present, `dir` otherwise.
pub fn image_root(dir: &Path) -> PathBuf {
    let nested = dir.join(IMAGES_DIR);
    if nested.is_dir() {
        nested
    } else {
        dir.to_path_buf()
    }
}

/// Lists every image below `root`, sorted by flattened name.
///
/// Caption files and anything else without an image extension are ignored.
pub fn list_frames(root: &Path) -> Result<Vec<Frame>, StageError> {
    let mut frames = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| StageError::Other(e.to_string()))?;
        if !entry.file_type().is_file() || !is_image(entry.path()) {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let flat_name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("_");

        frames.push(Frame {
            path: entry.path().to_path_buf(),
            flat_name,
        });
    }

    frames.sort_by(|a, b| a.flat_name.cmp(&b.flat_name));
    Ok(frames)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Output file name for a frame written as PNG.
pub fn png_name(stem: &str) -> String {
    format!("{}.png", stem)
}

pub fn load_image(path: &Path) -> Result<DynamicImage, StageError> {
    image::open(path).map_err(|e| StageError::ImageDecode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Writes `image` as PNG.
pub fn save_png(image: &DynamicImage, path: &Path) -> Result<(), StageError> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| StageError::ImageEncode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Copies a frame to `dest`, re-encoding to PNG if it is not one already.
pub fn copy_as_png(frame: &Path, dest: &Path) -> Result<(), StageError> {
    let is_png = frame
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("png"))
        .unwrap_or(false);

    if is_png {
        std::fs::copy(frame, dest)?;
        Ok(())
    } else {
        save_png(&load_image(frame)?, dest)
    }
}

/// Reads the caption stored next to an annotated dataset, if any.
pub fn read_caption(dataset: &Path, stem: &str) -> Option<String> {
    let path = dataset.join(CAPTIONS_DIR).join(format!("{}.txt", stem));
    std::fs::read_to_string(path)
        .ok()
        .map(|c| c.trim().to_string())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::{Rgb, RgbImage};

    /// Brightness layout of a synthetic frame.
    #[derive(Debug, Clone, Copy)]
    pub enum Pattern {
        /// Columns get brighter left to right.
        Rising,
        /// Columns get darker left to right.
        Falling,
        /// Rows alternate between rising and falling.
        Alternating,
    }

    /// A sharp, well-exposed grayscale frame: 9 column bands following
    /// `pattern` with a one-pixel checkerboard on top.
    pub fn textured(pattern: Pattern, width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let col = x * 9 / width;
            let row = y * 8 / height;
            let rising = 60 + col * 15;
            let falling = 180 - col * 15;
            let base = match pattern {
                Pattern::Rising => rising,
                Pattern::Falling => falling,
                Pattern::Alternating if row % 2 == 0 => rising,
                Pattern::Alternating => falling,
            };
            let value = (base + ((x + y) % 2) * 40) as u8;
            Rgb([value, value, value])
        })
    }

    /// A uniform frame of the given gray level.
    pub fn flat(level: u8, width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([level, level, level]))
    }
}
