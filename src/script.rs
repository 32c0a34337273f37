use std::collections::HashMap;
use std::future::Future;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::audit::{AuditLog, AuditRecord};
use crate::error::{GenerateError, SchemaIssue};
use crate::schema::{Scene, ScriptOutput};

/// Bounded retry for the whole script attempt: call, parse, validate. All
/// failure kinds are retried identically, sequentially, with no backoff.
pub const SCRIPT_ATTEMPTS: u32 = 3;

const OPENAI_CHAT_API: &str = "https://api.openai.com/v1/chat/completions";

/// Chat-completion collaborator: one round trip, raw text back.
pub trait ChatCompletion: Send + Sync {
    fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> impl Future<Output = Result<String, GenerateError>> + Send;
}

/// OpenAI-style chat-completions client.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    http: Client,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(http: Client, api_key: String, model: String) -> Self {
        Self {
            http,
            api_key,
            model,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl ChatCompletion for OpenAiChat {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, GenerateError> {
        let response = self
            .http
            .post(OPENAI_CHAT_API)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system_prompt },
                    { "role": "user", "content": user_prompt },
                ],
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerateError::Provider(format!(
                "chat API returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                GenerateError::Provider("chat response had no message content".to_owned())
            })
    }
}

/// System prompt instructing the model to emit the strict JSON script shape.
pub fn system_prompt(scene_count: usize) -> String {
    format!(
        "Your task is to create stories based on the user prompt. The story will be in a comics \
         format - it will have an image and some dialogue. You need to imagine {scene_count} \
         scenes from this comic. Create a prompt for the image generation AI, be as detailed and \
         consistent as possible, especially with the character descriptions. The image prompt \
         must be extra long and verbose. You need to describe the scene in great detail, each \
         character in it and what they are doing. The image AI doesn't know anything that \
         happened in other scenes, so list every character appearing in a scene in \
         charactersShown and describe each character once in characterDescriptions. You also \
         need to output the name of the character speaking and what they say. Provide all of \
         this in JSON - the schema is `{{ \"scenes\": [{{ \"imagePrompt\": \"string\", \
         \"speechBubble\": {{ \"characterName\": \"string\", \"text\": \"string\" }}, \
         \"charactersShown\": [\"string\"] }}], \"characterDescriptions\": \
         [{{ \"characterName\": \"string\", \"verboseDescription\": \"string\" }}] }}`. \
         Do not output anything apart from the JSON."
    )
}

/// Models often wrap the JSON in markdown fences despite instructions.
fn strip_code_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn require_string(value: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    if !value.is_string() {
        issues.push(SchemaIssue {
            path: path.to_owned(),
            message: format!("expected a string, got {}", type_name(value)),
        });
    }
}

/// Structural validation of the parsed script value, collecting every
/// field-level problem instead of stopping at the first.
fn validate_script_value(value: &Value) -> Vec<SchemaIssue> {
    let mut issues = Vec::new();

    let Some(root) = value.as_object() else {
        issues.push(SchemaIssue {
            path: String::new(),
            message: format!("expected an object, got {}", type_name(value)),
        });
        return issues;
    };

    match root.get("scenes") {
        None => issues.push(SchemaIssue {
            path: "scenes".to_owned(),
            message: "missing field".to_owned(),
        }),
        Some(scenes) => match scenes.as_array() {
            None => issues.push(SchemaIssue {
                path: "scenes".to_owned(),
                message: format!("expected an array, got {}", type_name(scenes)),
            }),
            Some(scenes) => {
                for (i, scene) in scenes.iter().enumerate() {
                    validate_scene(scene, i, &mut issues);
                }
            }
        },
    }

    if let Some(descriptions) = root.get("characterDescriptions") {
        match descriptions.as_array() {
            None => issues.push(SchemaIssue {
                path: "characterDescriptions".to_owned(),
                message: format!("expected an array, got {}", type_name(descriptions)),
            }),
            Some(descriptions) => {
                for (i, description) in descriptions.iter().enumerate() {
                    let path = format!("characterDescriptions[{i}]");
                    let Some(description) = description.as_object() else {
                        issues.push(SchemaIssue {
                            path,
                            message: format!("expected an object, got {}", type_name(description)),
                        });
                        continue;
                    };
                    for field in ["characterName", "verboseDescription"] {
                        match description.get(field) {
                            None => issues.push(SchemaIssue {
                                path: format!("{path}.{field}"),
                                message: "missing field".to_owned(),
                            }),
                            Some(value) => {
                                require_string(value, &format!("{path}.{field}"), &mut issues)
                            }
                        }
                    }
                }
            }
        }
    }

    issues
}

fn validate_scene(scene: &Value, index: usize, issues: &mut Vec<SchemaIssue>) {
    let path = format!("scenes[{index}]");
    let Some(scene) = scene.as_object() else {
        issues.push(SchemaIssue {
            path,
            message: format!("expected an object, got {}", type_name(scene)),
        });
        return;
    };

    match scene.get("imagePrompt") {
        None => issues.push(SchemaIssue {
            path: format!("{path}.imagePrompt"),
            message: "missing field".to_owned(),
        }),
        Some(value) => require_string(value, &format!("{path}.imagePrompt"), issues),
    }

    if let Some(bubble) = scene.get("speechBubble") {
        if !bubble.is_null() {
            match bubble.as_object() {
                None => issues.push(SchemaIssue {
                    path: format!("{path}.speechBubble"),
                    message: format!("expected an object, got {}", type_name(bubble)),
                }),
                Some(bubble) => {
                    match bubble.get("text") {
                        None => issues.push(SchemaIssue {
                            path: format!("{path}.speechBubble.text"),
                            message: "missing field".to_owned(),
                        }),
                        Some(text) => {
                            require_string(text, &format!("{path}.speechBubble.text"), issues)
                        }
                    }
                    if let Some(name) = bubble.get("characterName") {
                        if !name.is_null() {
                            require_string(
                                name,
                                &format!("{path}.speechBubble.characterName"),
                                issues,
                            );
                        }
                    }
                }
            }
        }
    }

    if let Some(shown) = scene.get("charactersShown") {
        match shown.as_array() {
            None => issues.push(SchemaIssue {
                path: format!("{path}.charactersShown"),
                message: format!("expected an array, got {}", type_name(shown)),
            }),
            Some(shown) => {
                for (i, entry) in shown.iter().enumerate() {
                    require_string(entry, &format!("{path}.charactersShown[{i}]"), issues);
                }
            }
        }
    }
}

/// Strict parse of the raw model output: fences stripped, JSON parse failure
/// is `MalformedJson`, shape failure is `InvalidSchema` with every issue.
pub fn parse_script_output(raw: &str) -> Result<ScriptOutput, GenerateError> {
    let cleaned = strip_code_fences(raw);
    let value: Value = serde_json::from_str(cleaned)
        .map_err(|error| GenerateError::MalformedJson(error.to_string()))?;

    let issues = validate_script_value(&value);
    if !issues.is_empty() {
        return Err(GenerateError::InvalidSchema(issues));
    }

    serde_json::from_value(value).map_err(|error| {
        GenerateError::InvalidSchema(vec![SchemaIssue {
            path: String::new(),
            message: error.to_string(),
        }])
    })
}

/// Appends `"{character} is {description}. "` to each scene's image prompt
/// for every character it shows. A character with no matching description
/// contributes nothing.
pub fn enrich_scene_prompts(output: &mut ScriptOutput) {
    let descriptions: HashMap<String, String> = output
        .character_descriptions
        .iter()
        .map(|d| (d.character_name.clone(), d.verbose_description.clone()))
        .collect();

    for scene in &mut output.scenes {
        for character in &scene.characters_shown {
            if let Some(description) = descriptions.get(character) {
                scene
                    .image_prompt
                    .push_str(&format!("{character} is {description}. "));
            }
        }
    }
}

/// One script-generation attempt: call the chat collaborator, parse and
/// validate, enrich prompts. Every attempt, success or failure, is recorded
/// to the audit log with the raw exchange.
pub async fn generate_script(
    chat: &impl ChatCompletion,
    audit: &dyn AuditLog,
    prompt: &str,
    scene_count: usize,
) -> Result<Vec<Scene>, GenerateError> {
    let system = system_prompt(scene_count);

    let raw = match chat.complete(&system, prompt).await {
        Ok(raw) => raw,
        Err(error) => {
            audit.record(AuditRecord::script(
                prompt,
                None,
                &system,
                Some(error.to_string()),
            ));
            return Err(error);
        }
    };

    let parsed = parse_script_output(&raw);
    audit.record(AuditRecord::script(
        prompt,
        Some(&raw),
        &system,
        parsed.as_ref().err().map(|error| error.to_string()),
    ));

    let mut output = parsed?;
    enrich_scene_prompts(&mut output);
    info!(scenes = output.scenes.len(), "script generated");
    Ok(output.scenes)
}

/// Wraps [`generate_script`] in the bounded retry loop: first success wins,
/// the last failure is returned once the attempt budget is spent.
pub async fn generate_script_with_retry(
    chat: &impl ChatCompletion,
    audit: &dyn AuditLog,
    prompt: &str,
    scene_count: usize,
) -> Result<Vec<Scene>, GenerateError> {
    let mut attempt = 1;
    loop {
        match generate_script(chat, audit, prompt, scene_count).await {
            Ok(scenes) => return Ok(scenes),
            Err(error) if attempt < SCRIPT_ATTEMPTS => {
                warn!(attempt, error = %error, "script generation attempt failed");
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::{
        generate_script, generate_script_with_retry, parse_script_output, ChatCompletion,
        SCRIPT_ATTEMPTS,
    };
    use crate::audit::{AuditLog, MemoryAuditLog};
    use crate::error::GenerateError;

    const VALID_SCRIPT: &str = r#"{
        "scenes": [
            {
                "imagePrompt": "A knight rides toward a windmill.",
                "speechBubble": { "characterName": "Don", "text": "Giants!" },
                "charactersShown": ["Don", "Sancho"]
            },
            {
                "imagePrompt": "The windmill, unmoved.",
                "speechBubble": { "characterName": null, "text": "(creaking)" },
                "charactersShown": ["Ghost"]
            }
        ],
        "characterDescriptions": [
            { "characterName": "Don", "verboseDescription": "a gaunt knight in dented armor" }
        ]
    }"#;

    struct FakeChat {
        responses: Vec<Result<String, ()>>,
        calls: AtomicU32,
    }

    impl FakeChat {
        fn new(responses: Vec<Result<String, ()>>) -> Self {
            Self {
                responses,
                calls: AtomicU32::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ChatCompletion for FakeChat {
        async fn complete(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<String, GenerateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match &self.responses[call.min(self.responses.len() - 1)] {
                Ok(raw) => Ok(raw.clone()),
                Err(()) => Err(GenerateError::Provider("chat API returned 500".to_owned())),
            }
        }
    }

    #[test]
    fn non_json_output_is_malformed_json() {
        let error = parse_script_output("{not json").expect_err("parse must fail");
        assert!(matches!(error, GenerateError::MalformedJson(_)));
    }

    #[test]
    fn fenced_json_is_accepted() {
        let fenced = format!("```json\n{VALID_SCRIPT}\n```");
        let output = parse_script_output(&fenced).expect("fenced JSON parses");
        assert_eq!(output.scenes.len(), 2);
    }

    #[test]
    fn shape_violations_collect_field_level_issues() {
        let raw = r#"{
            "scenes": [
                { "speechBubble": { "characterName": 7 } },
                "not a scene"
            ],
            "characterDescriptions": { "oops": true }
        }"#;
        let error = parse_script_output(raw).expect_err("validation must fail");
        let GenerateError::InvalidSchema(issues) = error else {
            panic!("expected InvalidSchema, got {error:?}");
        };

        let paths: Vec<&str> = issues.iter().map(|issue| issue.path.as_str()).collect();
        assert!(paths.contains(&"scenes[0].imagePrompt"));
        assert!(paths.contains(&"scenes[0].speechBubble.text"));
        assert!(paths.contains(&"scenes[0].speechBubble.characterName"));
        assert!(paths.contains(&"scenes[1]"));
        assert!(paths.contains(&"characterDescriptions"));
    }

    #[tokio::test]
    async fn described_characters_are_appended_and_unknown_ones_skipped() {
        let chat = FakeChat::new(vec![Ok(VALID_SCRIPT.to_owned())]);
        let audit = MemoryAuditLog::new();

        let scenes = generate_script(&chat, &audit, "tilting at windmills", 2)
            .await
            .expect("script generates");

        assert_eq!(scenes.len(), 2);
        // "Don" has a description; "Sancho" and "Ghost" do not and add nothing.
        assert_eq!(
            scenes[0].image_prompt,
            "A knight rides toward a windmill.Don is a gaunt knight in dented armor. "
        );
        assert_eq!(scenes[1].image_prompt, "The windmill, unmoved.");
    }

    #[tokio::test]
    async fn malformed_output_is_audited_with_a_non_empty_error() {
        let chat = FakeChat::new(vec![Ok("{not json".to_owned())]);
        let audit = MemoryAuditLog::new();

        let result = generate_script(&chat, &audit, "a prompt", 3).await;
        assert!(matches!(result, Err(GenerateError::MalformedJson(_))));

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].input, "a prompt");
        assert_eq!(records[0].output.as_deref(), Some("{not json"));
        assert!(records[0]
            .system_prompt
            .as_deref()
            .is_some_and(|p| !p.is_empty()));
        assert!(records[0].error.as_deref().is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn retry_stops_at_first_success() {
        let chat = FakeChat::new(vec![
            Err(()),
            Ok("{not json".to_owned()),
            Ok(VALID_SCRIPT.to_owned()),
        ]);
        let audit = MemoryAuditLog::new();

        let scenes = generate_script_with_retry(&chat, &audit, "p", 2)
            .await
            .expect("third attempt succeeds");
        assert_eq!(scenes.len(), 2);
        assert_eq!(chat.call_count(), 3);
        // Every attempt was audited, including the failures.
        assert_eq!(audit.records().len(), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let chat = FakeChat::new(vec![Err(())]);
        let audit = MemoryAuditLog::new();

        let result = generate_script_with_retry(&chat, &audit, "p", 2).await;
        assert!(result.is_err());
        assert_eq!(chat.call_count(), SCRIPT_ATTEMPTS);
    }
}
