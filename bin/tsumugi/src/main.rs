use std::{collections::HashMap, num::NonZeroU32, path::PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use fake_user_agent::get_chrome_rua;
use tsumugi::{
    key::ContentKey, DownloadOrchestrator, DownloadRequest, DrmOptions, EngineConfig, Interrupt,
    InterruptLevel, ResolutionPolicy, SelectionPolicy,
};
use url::Url;

#[derive(Parser, Debug, Clone)]
#[clap(name = "tsumugi", version, about)]
pub struct TsumugiArgs {
    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,

    /// Engine configuration in JSON. Command line options take precedence.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Video threads limit
    #[clap(long)]
    threads: Option<NonZeroU32>,

    /// Audio threads limit
    #[clap(long)]
    audio_threads: Option<NonZeroU32>,

    /// Attempts per segment before it is put aside for the next round
    #[clap(long)]
    retries: Option<u32>,

    /// Output file path
    #[clap(short, long, default_value = "./output.mkv")]
    output: PathBuf,

    /// Temporary file path
    #[clap(long, env = "TEMP")]
    temp_dir: Option<PathBuf>,

    /// Keep temporary files.
    #[clap(short, long)]
    keep: bool,

    /// Content keys in `KID:KEY` form, separated by `;`.
    #[clap(long)]
    key: Option<String>,

    /// Cookies used to download, eg. "a=1; b=2".
    #[clap(long)]
    cookies: Option<String>,

    /// HTTP Header used to download
    ///
    /// Custom header. eg. "User-Agent: xxxxx".
    #[clap(short = 'H', long)]
    headers: Vec<String>,

    /// Video resolution: best, worst, 1080p or 1920x1080.
    #[clap(long, default_value = "best")]
    resolution: String,

    /// Preferred audio languages, most preferred first. eg. "ja,en".
    #[clap(long, value_delimiter = ',')]
    lang: Vec<String>,

    /// License server, overrides the one in the manifest.
    #[clap(long)]
    license_url: Option<String>,

    /// Extra header sent to the license server.
    #[clap(long)]
    license_header: Vec<String>,

    /// JSON object posted to the license server, the challenge is added as
    /// `challenge`.
    #[clap(long)]
    license_payload: Option<String>,

    /// Manifest URL
    url: Url,
}

fn parse_header(header: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = header
        .split_once(':')
        .with_context(|| format!("Invalid header: {header}"))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

impl TsumugiArgs {
    fn config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&data)
                    .with_context(|| format!("Invalid configuration in {}", path.display()))?
            }
            None => EngineConfig::default(),
        };

        if let Some(threads) = self.threads {
            config.video_concurrency = threads;
        }
        if let Some(threads) = self.audio_threads {
            config.audio_concurrency = threads;
        }
        if let Some(retries) = self.retries {
            config.retry.max_attempts = retries;
        }
        if let Some(temp_dir) = &self.temp_dir {
            if !temp_dir.exists() {
                tracing::error!("Temporary path directory does not exist.");
                bail!("Temporary path directory does not exist.");
            }
            let temp_dir = temp_dir.canonicalize()?;
            tracing::info!("Temporary path sets to {}", temp_dir.display());
            config.temp_dir = temp_dir;
        }
        config.keep_temp |= self.keep;

        Ok(config)
    }

    fn request(&self) -> anyhow::Result<DownloadRequest> {
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), get_chrome_rua().to_string());
        for header in &self.headers {
            let (key, value) = parse_header(header)?;
            headers.insert(key, value);
        }

        let cookies: Vec<String> = self
            .cookies
            .as_deref()
            .map(|cookies| {
                cookies
                    .split(';')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let license_headers: HashMap<String, String> = self
            .license_header
            .iter()
            .map(|header| parse_header(header))
            .collect::<anyhow::Result<_>>()?;
        let payload: Option<serde_json::Value> = self
            .license_payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Invalid license payload")?;
        let keys = match &self.key {
            Some(key) => ContentKey::parse_list(key)?,
            None => Vec::new(),
        };

        let mut request = DownloadRequest::new(self.url.clone(), self.output.clone())
            .selection(SelectionPolicy {
                resolution: ResolutionPolicy::from(self.resolution.clone()),
                languages: self.lang.clone(),
            })
            .drm(DrmOptions {
                license_url: self.license_url.clone(),
                headers: license_headers,
                payload,
                keys,
            });
        request.headers = headers;
        request.cookies = cookies;
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = TsumugiArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .try_from_env()
                .unwrap_or_else(|_| format!("tsumugi={default_level}").into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.config()?;
    let request = args.request()?;

    let interrupt = Interrupt::new();
    tokio::spawn({
        let interrupt = interrupt.clone();
        async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if interrupt.signal() == InterruptLevel::Immediate {
                    break;
                }
            }
        }
    });

    let orchestrator = DownloadOrchestrator::builder()
        .muxer(tsumugi::merge::AutoMuxer::new(config.muxer))
        .config(config)
        .interrupt(interrupt)
        .build();
    let result = orchestrator.run(request).await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(error) = result.error {
        bail!(error);
    }
    Ok(())
}
