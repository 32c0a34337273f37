use serde::{Deserialize, Serialize};

/// Dialogue line rendered under a scene image. `character_name` is optional;
/// an absent name renders the text with no speaker prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechBubble {
    pub character_name: Option<String>,
    pub text: String,
}

/// One comic panel as described by the script model. The position of a scene
/// in the script is significant: it is the join key used to reconcile
/// partial re-generation results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub image_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_bubble: Option<SpeechBubble>,
    #[serde(default)]
    pub characters_shown: Vec<String>,
}

/// Reusable character description emitted alongside the scenes. Only used to
/// enrich scene image prompts; not retained afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterDescription {
    pub character_name: String,
    pub verbose_description: String,
}

/// Complete script payload the chat model is instructed to emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutput {
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub character_descriptions: Vec<CharacterDescription>,
}

/// One captioned scene image produced by a generation batch. `index` values
/// are unique within a batch and correspond 1:1 to input scene positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedSceneImage {
    pub index: usize,
    /// Base64-encoded PNG, no data-URI prefix.
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_bubble: Option<SpeechBubble>,
    pub image_prompt: String,
}
