use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use tracing::{debug, warn};

use crate::audit::{AuditLog, AuditRecord};
use crate::backends::GenerateImage;
use crate::error::GenerateError;
use crate::schema::{RenderedSceneImage, Scene, SpeechBubble};

/// Fixed quality/style suffix appended to every scene's image prompt.
pub const IMAGE_STYLE_SUFFIX: &str =
    " Comic book style, bold ink outlines, vibrant flat colors.";

/// What happens when an individual scene's image call fails.
pub enum FailurePolicy<'a> {
    /// The whole batch fails; no partial results are kept. Already-started
    /// sibling calls still run to completion; their results are discarded.
    Abort,
    /// Partial-regenerate mode: scenes not flagged in `regenerate` keep their
    /// prior entry and are never dispatched; a dispatched scene that fails
    /// falls back to the prior entry at the same index, if one exists.
    ReusePrior {
        prior: &'a [RenderedSceneImage],
        regenerate: &'a HashSet<usize>,
    },
}

fn prior_at<'a>(
    prior: &'a [RenderedSceneImage],
    index: usize,
) -> Option<&'a RenderedSceneImage> {
    prior.iter().find(|entry| entry.index == index)
}

/// Failures that settled after the index that aborts the batch still get an
/// audit record before the merge returns.
fn audit_settled_failures(
    audit: &dyn AuditLog,
    prompts: &HashMap<usize, &str>,
    outcomes: &mut HashMap<usize, Result<String, GenerateError>>,
) {
    for (index, outcome) in outcomes.drain() {
        if let Err(error) = outcome {
            audit.record(AuditRecord::scene_image(
                prompts.get(&index).copied().unwrap_or_default(),
                Some(error.to_string()),
            ));
        }
    }
}

/// Generates one image per scene, concurrently, and returns a list
/// positionally aligned to the input scenes.
///
/// The first `scene_limit` scenes are taken; the rest are dropped, which is
/// documented truncation rather than an error. All selected scenes are
/// dispatched in one batch and the batch completes only when every call has
/// settled. Successful images are passed through `caption` (the
/// speech-bubble compositor) serially after the batch settles.
///
/// Merge precedence, per index: an explicit "unchanged" flag wins and keeps
/// the prior entry; otherwise a fresh result is used; a failed fresh call
/// falls back to the prior entry; a failure with nothing to fall back on
/// fails the batch. A scene with no prior entry is always dispatched, even
/// when unflagged.
pub async fn generate_images<B, C>(
    backend: &B,
    audit: &dyn AuditLog,
    mut caption: C,
    scenes: &[Scene],
    scene_limit: usize,
    policy: FailurePolicy<'_>,
) -> Result<Vec<RenderedSceneImage>, GenerateError>
where
    B: GenerateImage,
    C: FnMut(&str, Option<&SpeechBubble>) -> Result<String, GenerateError>,
{
    let selected = &scenes[..scene_limit.min(scenes.len())];

    let dispatch: Vec<usize> = match &policy {
        FailurePolicy::Abort => (0..selected.len()).collect(),
        FailurePolicy::ReusePrior { prior, regenerate } => (0..selected.len())
            .filter(|index| regenerate.contains(index) || prior_at(prior, *index).is_none())
            .collect(),
    };
    debug!(
        scenes = selected.len(),
        dispatched = dispatch.len(),
        "dispatching scene image batch"
    );

    let jobs: Vec<(usize, String)> = dispatch
        .iter()
        .map(|&index| {
            (
                index,
                format!("{}{IMAGE_STYLE_SUFFIX}", selected[index].image_prompt),
            )
        })
        .collect();

    let batch = jobs.iter().map(|(index, prompt)| async move {
        (*index, backend.generate(prompt).await)
    });
    let mut outcomes: HashMap<usize, Result<String, GenerateError>> =
        join_all(batch).await.into_iter().collect();
    let prompts: HashMap<usize, &str> = jobs
        .iter()
        .map(|(index, prompt)| (*index, prompt.as_str()))
        .collect();

    let mut merged = Vec::with_capacity(selected.len());
    for (index, scene) in selected.iter().enumerate() {
        let fresh = match outcomes.remove(&index) {
            Some(Ok(image)) => {
                // Captioning failures (undecodable image bytes) count as
                // scene failures and follow the same fallback rules.
                Some(caption(&image, scene.speech_bubble.as_ref()))
            }
            Some(Err(error)) => Some(Err(error)),
            None => None,
        };

        match (fresh, &policy) {
            (Some(Ok(image)), _) => merged.push(RenderedSceneImage {
                index,
                image,
                speech_bubble: scene.speech_bubble.clone(),
                image_prompt: prompts
                    .get(&index)
                    .map(|p| (*p).to_owned())
                    .unwrap_or_default(),
            }),
            (Some(Err(error)), FailurePolicy::Abort) => {
                audit.record(AuditRecord::scene_image(
                    prompts.get(&index).copied().unwrap_or_default(),
                    Some(error.to_string()),
                ));
                audit_settled_failures(audit, &prompts, &mut outcomes);
                return Err(error);
            }
            (Some(Err(error)), FailurePolicy::ReusePrior { prior, .. }) => {
                audit.record(AuditRecord::scene_image(
                    prompts.get(&index).copied().unwrap_or_default(),
                    Some(error.to_string()),
                ));
                match prior_at(prior, index) {
                    Some(entry) => {
                        warn!(index, error = %error, "scene failed, reusing prior image");
                        merged.push(entry.clone());
                    }
                    None => {
                        audit_settled_failures(audit, &prompts, &mut outcomes);
                        return Err(error);
                    }
                }
            }
            (None, FailurePolicy::ReusePrior { prior, .. }) => {
                // Not dispatched, so a prior entry is guaranteed to exist.
                match prior_at(prior, index) {
                    Some(entry) => merged.push(entry.clone()),
                    None => unreachable!("undispatched scene without a prior entry"),
                }
            }
            (None, FailurePolicy::Abort) => {
                unreachable!("abort policy dispatches every selected scene")
            }
        }
    }

    Ok(merged)
}
