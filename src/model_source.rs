//! Finding model weights on disk, or fetching them from the Hugging Face hub.
//!
//! A locator is either a local directory, or an `owner/name` repository id.
//! Repositories are downloaded once into a cache directory and reused.

use std::{fmt, io::Write as _, str::FromStr, sync::LazyLock, time::Duration};

use directories::ProjectDirs;
use futures::StreamExt as _;
use regex::Regex;

use crate::prelude::*;

/// What a hub repository id looks like.
static REPO_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*/[A-Za-z0-9][A-Za-z0-9._-]*$")
        .expect("failed to compile regex")
});

/// Default hub endpoint. Override with `HF_ENDPOINT`.
const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

/// A file we fetch from a hub repository.
struct HubFile {
    /// Path inside the repository.
    path: &'static str,
    /// Can we live without it?
    optional: bool,
}

/// Files making up an ONNX export of a vision encoder-decoder model.
const TROCR_FILES: &[HubFile] = &[
    HubFile {
        path: "onnx/encoder_model.onnx",
        optional: false,
    },
    HubFile {
        path: "onnx/decoder_model.onnx",
        optional: false,
    },
    HubFile {
        path: "tokenizer.json",
        optional: false,
    },
    HubFile {
        path: "config.json",
        optional: true,
    },
    HubFile {
        path: "generation_config.json",
        optional: true,
    },
    HubFile {
        path: "preprocessor_config.json",
        optional: true,
    },
];

/// Where to get a model from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocator {
    /// A directory on disk.
    Local(PathBuf),
    /// A Hugging Face repository id, like `Xenova/trocr-base-handwritten`.
    Hub(String),
}

impl FromStr for ModelLocator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            bail!("model locator must not be empty");
        }
        let path = Path::new(s);
        if path.exists() || !REPO_ID_REGEX.is_match(s) {
            Ok(Self::Local(path.to_owned()))
        } else {
            Ok(Self::Hub(s.to_owned()))
        }
    }
}

impl fmt::Display for ModelLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Hub(repo) => write!(f, "hub:{}", repo),
        }
    }
}

impl ModelLocator {
    /// Get a local directory holding the model, downloading it if needed.
    #[instrument(level = "debug", skip_all, fields(locator = %self))]
    pub async fn resolve(&self) -> Result<PathBuf> {
        match self {
            Self::Local(path) => {
                if !path.is_dir() {
                    bail!("model directory {:?} does not exist", path.display());
                }
                Ok(path.clone())
            }
            Self::Hub(repo) => {
                let dir = cache_dir()?.join(repo.replace('/', "--"));
                let offline = std::env::var_os("DUAL_OCR_OFFLINE").is_some();
                fetch_repo(repo, &dir, TROCR_FILES, offline).await?;
                Ok(dir)
            }
        }
    }
}

/// Where downloaded models live. `DUAL_OCR_CACHE_DIR` wins if set.
fn cache_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("DUAL_OCR_CACHE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let dirs = ProjectDirs::from("", "", "dual-ocr")
        .ok_or_else(|| anyhow!("cannot determine a cache directory; set DUAL_OCR_CACHE_DIR"))?;
    Ok(dirs.cache_dir().join("models"))
}

/// Where we remember that an optional file is absent from the hub.
fn absent_marker(dir: &Path, file: &HubFile) -> PathBuf {
    dir.join(format!("{}.absent", file.path))
}

/// Files we still need to ask the hub for. Optional files the hub didn't
/// have last time are not asked for again.
fn files_to_fetch<'a>(dir: &Path, files: &'a [HubFile]) -> Vec<&'a HubFile> {
    files
        .iter()
        .filter(|file| {
            !dir.join(file.path).exists()
                && !(file.optional && absent_marker(dir, file).exists())
        })
        .collect()
}

/// Download any missing files of a hub repository into `dir`.
///
/// When `offline`, only required files must be cached already.
async fn fetch_repo(repo: &str, dir: &Path, files: &[HubFile], offline: bool) -> Result<()> {
    let missing = files_to_fetch(dir, files);
    if missing.is_empty() {
        debug!(dir = %dir.display(), "Model already cached");
        return Ok(());
    }
    if offline {
        if missing.iter().any(|file| !file.optional) {
            bail!(
                "{} is not cached in {:?} and DUAL_OCR_OFFLINE is set",
                repo,
                dir.display()
            );
        }
        debug!(dir = %dir.display(), "Offline; using cached model without optional files");
        return Ok(());
    }

    let endpoint = std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_HUB_ENDPOINT.to_owned());
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .context("failed to create HTTP client")?;
    for file in missing {
        let url = format!("{}/{}/resolve/main/{}", endpoint.trim_end_matches('/'), repo, file.path);
        let dest = dir.join(file.path);
        match download(&client, &url, &dest).await {
            Ok(true) => {}
            Ok(false) if file.optional => {
                debug!(url = %url, "Optional model file not found");
                let marker = absent_marker(dir, file);
                if let Some(parent) = marker.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {:?}", parent.display()))?;
                }
                std::fs::write(&marker, b"")
                    .with_context(|| format!("failed to write {:?}", marker.display()))?;
            }
            Ok(false) => bail!("{} not found", url),
            Err(err) => return Err(err.context(format!("failed to download {}", url))),
        }
    }
    Ok(())
}

/// Stream a URL into `dest`. Returns `false` on 404.
async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<bool> {
    info!(url = %url, "Downloading model file");
    let response = client.get(url).send().await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(false);
    }
    let response = response.error_for_status()?;

    // Write to a temporary file next to the destination, so an interrupted
    // download never looks like a cached file.
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {:?}", dest.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {:?}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("error reading download stream")?;
        tmp.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    tmp.flush()?;
    tmp.persist(dest)
        .with_context(|| format!("failed to save {:?}", dest.display()))?;
    debug!(bytes = written, dest = %dest.display(), "Downloaded");
    Ok(true)
}
