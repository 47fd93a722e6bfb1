//! Character grouping by hair and eye colour.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::images::{
    copy_as_png, ensure_input, image_root, list_frames, read_caption, Frame, CAPTIONS_DIR,
    IMAGES_DIR,
};
use super::{Stage, StageContext};
use crate::error::StageError;
use crate::resources::{Availability, Tagger};

/// Group receiving frames whose colours could not be determined.
pub const UNCLASSIFIED: &str = "unclassified";

pub const HAIR_COLORS: &[&str] = &[
    "blonde", "black", "brown", "red", "blue", "green", "purple", "pink", "orange", "silver",
    "white", "gray", "aqua",
];

pub const EYE_COLORS: &[&str] = &[
    "blue", "brown", "red", "green", "purple", "yellow", "pink", "aqua", "orange", "gray",
];

/// Copies every frame into `images/<hair>_<eyes>/` based on its caption, or
/// on fresh tags when the frame has no caption. Captions are carried over.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassificationStage;

#[async_trait]
impl Stage for ClassificationStage {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        ctx: &StageContext,
    ) -> Result<PathBuf, StageError> {
        ensure_input(input)?;

        let dataset = input.to_path_buf();
        let frames = tokio::task::spawn_blocking(move || collect_captions(&dataset)).await??;

        // The tagger is only needed for frames that were never annotated.
        let tagger = if frames.iter().any(|(_, caption)| caption.is_none()) {
            match ctx.resources.tagger().await {
                Availability::Ready(tagger) => Some(tagger),
                Availability::Unavailable(reason) => {
                    warn!(job = %ctx.job_id, reason = %reason, "Tagger unavailable, uncaptioned frames go to '{}'", UNCLASSIFIED);
                    None
                }
            }
        } else {
            None
        };

        let dest = output.to_path_buf();
        let threshold = ctx.config.tag_threshold;
        let groups =
            tokio::task::spawn_blocking(move || classify(frames, &dest, threshold, tagger))
                .await??;

        info!(job = %ctx.job_id, groups = groups, "Classification finished");
        Ok(output.to_path_buf())
    }
}

fn collect_captions(dataset: &Path) -> Result<Vec<(Frame, Option<String>)>, StageError> {
    Ok(list_frames(&image_root(dataset))?
        .into_iter()
        .map(|frame| {
            let caption = read_caption(dataset, frame.stem());
            (frame, caption)
        })
        .collect())
}

fn classify(
    frames: Vec<(Frame, Option<String>)>,
    output: &Path,
    threshold: f64,
    tagger: Option<Arc<dyn Tagger>>,
) -> Result<usize, StageError> {
    let images_dir = output.join(IMAGES_DIR);
    std::fs::create_dir_all(&images_dir)?;
    let mut groups: Vec<String> = Vec::new();

    for (frame, caption) in frames {
        let description = match (&caption, &tagger) {
            (Some(caption), _) => Some(caption.clone()),
            (None, Some(tagger)) => Some(
                tagger
                    .tag(&frame.path)?
                    .into_iter()
                    .filter(|t| t.score > threshold)
                    .map(|t| t.name)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            (None, None) => None,
        };

        let group = description
            .as_deref()
            .map(group_for)
            .unwrap_or_else(|| UNCLASSIFIED.to_string());

        let group_dir = images_dir.join(&group);
        std::fs::create_dir_all(&group_dir)?;
        copy_as_png(&frame.path, &group_dir.join(format!("{}.png", frame.stem())))?;

        if let Some(caption) = caption {
            let captions_dir = output.join(CAPTIONS_DIR);
            std::fs::create_dir_all(&captions_dir)?;
            std::fs::write(captions_dir.join(format!("{}.txt", frame.stem())), caption)?;
        }

        if !groups.contains(&group) {
            groups.push(group);
        }
    }

    Ok(groups.len())
}

/// Finds the first colour of `colors` followed by `suffix` in a tag string.
/// Underscores in tag names are treated as spaces.
pub fn detect_color(tags: &str, colors: &[&str], suffix: &str) -> Option<String> {
    let normalized = tags.to_lowercase().replace('_', " ");
    colors
        .iter()
        .find(|color| normalized.contains(&format!("{} {}", color, suffix)))
        .map(|color| color.to_string())
}

/// `<hair>_<eyes>`, or [`UNCLASSIFIED`] if either colour is unknown.
pub fn group_for(tags: &str) -> String {
    match (
        detect_color(tags, HAIR_COLORS, "hair"),
        detect_color(tags, EYE_COLORS, "eyes"),
    ) {
        (Some(hair), Some(eyes)) => format!("{}_{}", hair, eyes),
        _ => UNCLASSIFIED.to_string(),
    }
}
