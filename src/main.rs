use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};
use url::Url;

use ava::avatar_ref::{parse_avatar_src, AvatarRef};
use ava::resolver::{derive_candidates, CompanionResolver, HttpProbe};
use ava::settings::parse_order;
use ava::uploader::CompanionUploader;

#[derive(Debug, Parser)]
#[command(name = "ava")]
#[command(about = "AVA (Animated Avatar Augmenter): companion asset tools")]
#[command(version = version_string())]
struct Cli {
    /// Print probe and upload diagnostics.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Derive companion candidate URLs for an avatar reference (offline).
    Candidates {
        /// Absolute avatar URL, e.g. https://host/thumbnail?type=avatar&file=Aria.png
        url: String,
        /// Preference order, first hit wins.
        #[arg(long, default_value = "webp,webm,mp4")]
        order: String,
        #[arg(long)]
        json: bool,
    },
    /// Probe candidates against the live host and print the first hit.
    Resolve {
        url: String,
        #[arg(long, default_value = "webp,webm,mp4")]
        order: String,
        /// Probe with GET instead of HEAD.
        #[arg(long)]
        get: bool,
    },
    /// Upload an animated webp companion for a character.
    UploadCompanion {
        /// Path to the .webp file.
        #[arg(long)]
        file: PathBuf,
        /// Character base name the companion is stored under.
        #[arg(long)]
        name: String,
        /// Host origin, e.g. https://tavern.local
        #[arg(long)]
        host: String,
        /// CSRF token; fetched from /csrf-token when omitted.
        #[arg(long)]
        csrf: Option<String>,
    },
}

fn version_string() -> String {
    match option_env!("AVA_GIT_HASH") {
        Some(hash) => format!("{} ({hash})", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").to_owned(),
    }
}

fn parse_reference(raw: &str) -> Result<AvatarRef> {
    let url = Url::parse(raw).with_context(|| format!("'{raw}' is not an absolute URL"))?;
    parse_avatar_src(url.as_str(), &url).ok_or_else(|| {
        anyhow!(
            "'{raw}' is not a recognized avatar reference (expected a /thumbnail, /characters/ or /avatars/ URL)"
        )
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Candidates { url, order, json } => run_candidates(&url, &order, json),
        Commands::Resolve { url, order, get } => run_resolve(&url, &order, get, cli.verbose).await,
        Commands::UploadCompanion {
            file,
            name,
            host,
            csrf,
        } => run_upload(&file, &name, &host, csrf, cli.verbose).await,
    }
}

fn run_candidates(url: &str, order: &str, as_json: bool) -> Result<()> {
    let avatar = parse_reference(url)?;
    let order = parse_order(order)?;
    let candidates = derive_candidates(&avatar, &order);

    if as_json {
        let rows: Vec<Value> = candidates
            .iter()
            .map(|candidate| json!({ "kind": candidate.kind.as_str(), "url": candidate.url }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&Value::Array(rows))?);
        return Ok(());
    }

    println!(
        "{} candidates for {} '{}'",
        candidates.len(),
        avatar.kind.as_str(),
        avatar.base_name
    );
    for candidate in candidates {
        println!("{} {}", candidate.kind.as_str(), candidate.url);
    }
    Ok(())
}

async fn run_resolve(url: &str, order: &str, get: bool, verbose: bool) -> Result<()> {
    let avatar = parse_reference(url)?;
    let order = parse_order(order)?;
    let resolver = CompanionResolver::new(Rc::new(HttpProbe::new(Client::new())), order, !get)
        .with_verbose(verbose);

    match resolver.resolve(&avatar).await {
        Some(hit) => println!("{} {}", hit.kind.as_str(), hit.url),
        None => println!("no companion found for '{}'", avatar.base_name),
    }
    Ok(())
}

async fn run_upload(
    file: &Path,
    name: &str,
    host: &str,
    csrf: Option<String>,
    verbose: bool,
) -> Result<()> {
    let bytes =
        fs::read(file).with_context(|| format!("failed to read webp file {}", file.display()))?;
    let base = Url::parse(host).with_context(|| format!("'{host}' is not a valid origin"))?;
    let uploader = CompanionUploader::new(Client::new(), base, None)
        .with_csrf_override(csrf)
        .with_verbose(verbose);

    let body = uploader.upload_companion(name, &bytes).await?;
    println!("Uploaded {name}.webp ({} bytes)", bytes.len());
    if verbose {
        eprintln!("[DEBUG] server response: {body}");
    }
    Ok(())
}
