//! CLI for InkViz - tattoo concept previews.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use inkviz::image::{
    ColorPreference, GenerationRequest, ImageFormat, ReferenceImage, SizePreference,
};
use inkviz::logging::{self, LogFormat};
use inkviz::server::{self, AppState, DEFAULT_MAX_BODY_BYTES};
use inkviz::{
    request_timeout_from_secs, GenerationOrchestrator, GenerationOutcome, OrchestratorConfig,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "inkviz")]
#[command(about = "Generate tattoo concept previews via Replicate, Vertex AI and Hugging Face")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve(ServeArgs),

    /// Run the generation pipeline once
    Generate(GenerateArgs),

    /// Show which providers are configured
    Providers(OrchestratorArgs),
}

#[derive(Args)]
struct OrchestratorArgs {
    /// Provider moved to the front of the chain when configured (name fragment)
    #[arg(long, env = "INKVIZ_PREFERRED_PROVIDER", default_value = "Replicate")]
    preferred_provider: String,

    /// Deadline for the whole fallback chain in seconds (0 disables it)
    #[arg(long, env = "INKVIZ_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,
}

impl OrchestratorArgs {
    fn build(&self) -> anyhow::Result<GenerationOrchestrator> {
        let config = OrchestratorConfig::default()
            .with_preferred_provider(Some(self.preferred_provider.clone()))
            .with_request_timeout(request_timeout_from_secs(self.request_timeout_secs));
        Ok(GenerationOrchestrator::builder().config(config).build()?)
    }
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "INKVIZ_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Largest accepted request body in bytes
    #[arg(long, env = "INKVIZ_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    #[command(flatten)]
    orchestrator: OrchestratorArgs,
}

#[derive(Args)]
struct GenerateArgs {
    /// What the tattoo depicts
    subject: String,

    /// Style label, repeatable (e.g. "Fine Line", "Traditional")
    #[arg(short, long = "style", required = true)]
    styles: Vec<String>,

    /// small, medium, large or all
    #[arg(long, default_value = "all")]
    size: String,

    /// color or bw
    #[arg(long)]
    color: Option<String>,

    /// Candidate placement, repeatable
    #[arg(long = "body-part")]
    body_parts: Vec<String>,

    /// Reference image to transform (switches to image-to-image)
    #[arg(short, long)]
    reference: Option<PathBuf>,

    /// Where to write the image; the detected extension is added when missing
    #[arg(short, long, default_value = "tattoo.png")]
    output: PathBuf,

    #[command(flatten)]
    orchestrator: OrchestratorArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_env())?;

    match cli.command {
        Commands::Serve(args) => serve(args).await?,
        Commands::Generate(args) => generate(args, cli.json).await?,
        Commands::Providers(args) => list_providers(&args, cli.json)?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let orchestrator = Arc::new(args.orchestrator.build()?);
    let router = server::build_router(AppState::new(orchestrator), args.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(addr = %args.bind, "listening");

    server::serve(listener, router, server::shutdown_signal()).await?;
    Ok(())
}

fn build_request(args: &GenerateArgs) -> anyhow::Result<GenerationRequest> {
    let mut request = GenerationRequest::new(&args.subject, args.styles.iter().cloned())?
        .with_size(SizePreference::parse_lenient(&args.size))
        .with_body_parts(args.body_parts.iter().cloned());

    if let Some(color) = &args.color {
        request = request.with_color(ColorPreference::parse_lenient(color));
    }

    if let Some(path) = &args.reference {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read reference image {}", path.display()))?;
        let mime = ImageFormat::from_magic_bytes(&data).map(|f| f.mime_type());
        request = request.with_reference_image(ReferenceImage::new(data, mime));
    }

    Ok(request)
}

async fn generate(args: GenerateArgs, json_output: bool) -> anyhow::Result<()> {
    let request = build_request(&args)?;
    let orchestrator = args.orchestrator.build()?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    match orchestrator.generate(&request, &cancel).await? {
        GenerationOutcome::Generated(success) => {
            let output = output_path(&args.output, success.image.format);
            success.image.save(&output)?;

            if json_output {
                let result = serde_json::json!({
                    "success": true,
                    "output": output.display().to_string(),
                    "size_bytes": success.image.size(),
                    "format": success.image.format.extension(),
                    "mime_type": success.image.format.mime_type(),
                    "model": success.provider_name,
                    "prompt": success.prompt,
                    "attempts": success.attempts,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "Generated image: {} ({} bytes) via {}",
                    output.display(),
                    success.image.size(),
                    success.provider_name
                );
                println!("Prompt: {}", success.prompt);
            }
        }
        GenerationOutcome::Unavailable(unavailable) => {
            if json_output {
                println!("{}", serde_json::to_string_pretty(&unavailable)?);
            } else {
                println!("No image generated.");
                println!("Prompt: {}", unavailable.prompt);
                println!();
                println!("{}", unavailable.note);
                for error in &unavailable.errors {
                    println!("  - {error}");
                }
            }
        }
    }

    Ok(())
}

fn output_path(path: &Path, format: ImageFormat) -> PathBuf {
    if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.with_extension(format.extension())
    }
}

fn list_providers(args: &OrchestratorArgs, json_output: bool) -> anyhow::Result<()> {
    let orchestrator = args.build()?;
    let statuses = orchestrator.provider_statuses();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        println!("Image providers (in base priority order):");
        println!();
        for status in &statuses {
            let state = if status.configured {
                "configured"
            } else {
                "not configured"
            };
            println!(
                "  {:<32} {:<16} needs {}",
                status.name,
                state,
                status.required_credentials.join(", ")
            );
        }
        if let Some(preferred) = &orchestrator.config().preferred_provider {
            println!();
            println!("Preferred provider: {preferred}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_adds_detected_extension() {
        assert_eq!(
            output_path(Path::new("koi"), ImageFormat::Jpeg),
            PathBuf::from("koi.jpg")
        );
        assert_eq!(
            output_path(Path::new("out/koi.png"), ImageFormat::WebP),
            PathBuf::from("out/koi.png")
        );
    }

    #[test]
    fn test_generate_args_parse_color() {
        let cli = Cli::parse_from([
            "inkviz", "generate", "koi", "--style", "Japanese", "--color", "black-and-white",
        ]);
        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let request = build_request(&args).unwrap();
        assert_eq!(request.color(), ColorPreference::BlackAndWhite);
        assert_eq!(request.styles(), ["Japanese"]);
    }
}
