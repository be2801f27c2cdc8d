use anyhow::{Context, Result, anyhow};
use diagnosis_flow::{
    AgentFactory, Credential, PromptParams, UploadedImage, build_analysis_prompt, upload,
};
use medical_imaging_service::agent::{AgentSettings, LiteratureSearch, OpenRouterAgentFactory, PubMedSearch};
use medical_imaging_service::ServiceConfig;
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Medical Image -> Model Analysis Test");
    println!("====================================");

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <image_path> [modality] [region]", args[0]);
        eprintln!("Example: {} ./chest.png X-ray chest", args[0]);
        std::process::exit(1);
    }

    let api_key = env::var("OPENROUTER_API_KEY").unwrap_or_default();
    let Some(credential) = Credential::new(api_key) else {
        eprintln!("Please set OPENROUTER_API_KEY environment variable");
        std::process::exit(1);
    };

    let config = ServiceConfig::from_env()?;
    let image_path = &args[1];
    let params = PromptParams::new(args.get(2).cloned(), args.get(3).cloned());

    let bytes = std::fs::read(image_path).with_context(|| format!("Failed to read {}", image_path))?;
    let file_name = std::path::Path::new(image_path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid image path: {}", image_path))?
        .to_string();
    let image = UploadedImage::new(file_name, bytes);

    let metadata = upload::inspect(&image)?;
    println!(
        "Image: {} ({} {}x{}, {} bytes)",
        metadata.file_name, metadata.format, metadata.width, metadata.height, metadata.size_bytes
    );
    println!("Model: {}", config.model_id);
    println!();

    let http = reqwest::Client::new();
    let literature = config
        .literature_search
        .then(|| Arc::new(PubMedSearch::new(http.clone())) as Arc<dyn LiteratureSearch>);
    let factory = OpenRouterAgentFactory::new(
        http,
        AgentSettings {
            model_id: config.model_id.clone(),
            max_tokens: config.max_tokens,
        },
        literature,
    );
    let agent = factory.create(&credential);

    let staged = upload::stage(std::slice::from_ref(&image), &config.temp_dir)?;
    let result = agent
        .analyze(&build_analysis_prompt(&params), &staged.paths())
        .await;
    drop(staged);

    match result {
        Ok(analysis) => {
            println!("Analysis ({} characters):", analysis.len());
            println!("────────────────────────────────────");
            println!("{}", analysis);
        }
        Err(e) => {
            eprintln!("Analysis failed: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
