mod audit;
mod backends;
mod caption;
mod config;
mod error;
mod fanout;
mod mosaic;
mod schema;
mod script;
mod wrap;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

use crate::audit::{AuditLog, JsonlAuditLog, NullAuditLog};
use crate::backends::{DalleClient, ImageBackend, ImageModel, StableDiffusionClient};
use crate::caption::{process_image, TextPainter, CAPTION_FONT_SIZE};
use crate::config::{http_client, ProviderConfig};
use crate::fanout::FailurePolicy;
use crate::mosaic::{MosaicOptions, DEFAULT_PADDING, DEFAULT_WIGGLE};
use crate::schema::{RenderedSceneImage, Scene};
use crate::script::OpenAiChat;

#[derive(Debug, Parser)]
#[command(name = "storiesy")]
#[command(about = "Prompt-to-comic-strip generator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate a scene script from a prompt and print it as JSON.
    Script {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = 3)]
        scenes: usize,
    },
    /// Generate captioned images for a script file (JSON array of scenes).
    Images {
        script: PathBuf,
        #[arg(long, value_enum, default_value = "dalle")]
        model: ImageModel,
        #[arg(long)]
        scene_limit: Option<usize>,
        /// Results of a previous batch, for partial re-generation.
        #[arg(long)]
        prior: Option<PathBuf>,
        /// Scene indices to regenerate; unlisted scenes keep prior images.
        #[arg(long, value_delimiter = ',')]
        regenerate: Vec<usize>,
        /// TTF/OTF font used for the speech-bubble captions.
        #[arg(long)]
        font: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
    /// End-to-end: script, images, and a single mosaic PNG.
    Comic {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = 3)]
        scenes: usize,
        #[arg(long, value_enum, default_value = "dalle")]
        model: ImageModel,
        #[arg(long)]
        font: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Seed for the layout jitter; random when omitted.
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value_t = DEFAULT_PADDING)]
        padding: u32,
        #[arg(long, default_value_t = DEFAULT_WIGGLE)]
        wiggle: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ProviderConfig::from_env();

    match cli.command {
        Commands::Script { prompt, scenes } => run_script(&config, &prompt, scenes).await,
        Commands::Images {
            script,
            model,
            scene_limit,
            prior,
            regenerate,
            font,
            output,
        } => {
            run_images(
                &config,
                &script,
                model,
                scene_limit,
                prior.as_deref(),
                &regenerate,
                &font,
                &output,
            )
            .await
        }
        Commands::Comic {
            prompt,
            scenes,
            model,
            font,
            output,
            seed,
            padding,
            wiggle,
        } => {
            run_comic(
                &config,
                &prompt,
                scenes,
                model,
                &font,
                &output,
                seed,
                MosaicOptions { padding, wiggle },
            )
            .await
        }
    }
}

fn build_audit(config: &ProviderConfig) -> Box<dyn AuditLog> {
    match &config.audit_log {
        Some(path) => Box::new(JsonlAuditLog::new(path.clone())),
        None => Box::new(NullAuditLog),
    }
}

fn build_backend(
    model: ImageModel,
    config: &ProviderConfig,
    http: reqwest::Client,
) -> Result<ImageBackend> {
    match model {
        ImageModel::Dalle => {
            let key = config.require_openai_key()?;
            Ok(ImageBackend::Dalle(DalleClient::new(http, key.to_owned())))
        }
        ImageModel::StableDiffusion => {
            let (url, user, password) = config.require_image_service()?;
            Ok(ImageBackend::StableDiffusion(StableDiffusionClient::new(
                http,
                url.to_owned(),
                user.to_owned(),
                password.to_owned(),
            )))
        }
    }
}

fn load_painter(font: &Path) -> Result<TextPainter> {
    let bytes = fs::read(font)
        .with_context(|| format!("failed to read caption font {}", font.display()))?;
    TextPainter::new(&bytes, CAPTION_FONT_SIZE)
}

async fn run_script(config: &ProviderConfig, prompt: &str, scenes: usize) -> Result<()> {
    let http = http_client()?;
    let chat = OpenAiChat::new(
        http,
        config.require_openai_key()?.to_owned(),
        config.chat_model.clone(),
    );
    let audit = build_audit(config);

    let script = script::generate_script_with_retry(&chat, audit.as_ref(), prompt, scenes)
        .await
        .context("script generation failed")?;
    println!("{}", serde_json::to_string_pretty(&script)?);
    Ok(())
}

async fn run_images(
    config: &ProviderConfig,
    script_path: &Path,
    model: ImageModel,
    scene_limit: Option<usize>,
    prior_path: Option<&Path>,
    regenerate: &[usize],
    font: &Path,
    output: &Path,
) -> Result<()> {
    let scenes: Vec<Scene> = read_json(script_path)?;
    let prior: Vec<RenderedSceneImage> = match prior_path {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };

    let backend = build_backend(model, config, http_client()?)?;
    let audit = build_audit(config);
    let mut painter = load_painter(font)?;
    let limit = scene_limit.unwrap_or(scenes.len());

    let regenerate: HashSet<usize> = regenerate.iter().copied().collect();
    let policy = if prior_path.is_some() {
        FailurePolicy::ReusePrior {
            prior: &prior,
            regenerate: &regenerate,
        }
    } else {
        FailurePolicy::Abort
    };

    let results = fanout::generate_images(
        &backend,
        audit.as_ref(),
        |image, bubble| process_image(&mut painter, image, bubble),
        &scenes,
        limit,
        policy,
    )
    .await
    .context("image generation failed")?;

    fs::write(output, serde_json::to_string_pretty(&results)?)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote {} scene images to {}", results.len(), output.display());
    Ok(())
}

async fn run_comic(
    config: &ProviderConfig,
    prompt: &str,
    scenes: usize,
    model: ImageModel,
    font: &Path,
    output: &Path,
    seed: Option<u64>,
    options: MosaicOptions,
) -> Result<()> {
    // One client serves both the chat and image calls; its cookie store is
    // what carries the image service session.
    let http = http_client()?;
    let chat = OpenAiChat::new(
        http.clone(),
        config.require_openai_key()?.to_owned(),
        config.chat_model.clone(),
    );
    let audit = build_audit(config);
    let backend = build_backend(model, config, http)?;
    let mut painter = load_painter(font)?;

    let script = script::generate_script_with_retry(&chat, audit.as_ref(), prompt, scenes)
        .await
        .context("script generation failed")?;

    let limit = script.len();
    let rendered = fanout::generate_images(
        &backend,
        audit.as_ref(),
        |image, bubble| process_image(&mut painter, image, bubble),
        &script,
        limit,
        FailurePolicy::Abort,
    )
    .await
    .context("image generation failed")?;

    let images = rendered
        .iter()
        .map(|scene| caption::decode_base64_image(&scene.image))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to decode a rendered scene image")?;

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let Some(composite) = mosaic::compose_mosaic(&images, options, &mut rng) else {
        println!("No composite produced");
        return Ok(());
    };

    let bytes = BASE64
        .decode(composite)
        .context("mosaic produced invalid base64")?;
    fs::write(output, bytes).with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
