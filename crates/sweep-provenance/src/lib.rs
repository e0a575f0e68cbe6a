//! Version-control provenance and configuration digests for sweep run records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error("failed to run `git {args}`: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`git {args}` exited with {status}: {stderr}")]
    Git {
        args: String,
        status: String,
        stderr: String,
    },
}

/// The three provenance fields recorded next to every resolved sweep config.
///
/// Fields are `None` when the sweep ran outside a checkout or git was not
/// available; they still serialize (as null) so the record keeps its shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub git_dirty: Option<bool>,
    pub git_branch: Option<String>,
    pub git_hash: Option<String>,
}

pub trait ProvenanceSource {
    fn provenance(&self) -> Result<Provenance, ProvenanceError>;
}

/// A fixed value is its own source; useful when provenance is already known.
impl ProvenanceSource for Provenance {
    fn provenance(&self) -> Result<Provenance, ProvenanceError> {
        Ok(self.clone())
    }
}

/// Reads provenance from the git checkout enclosing `dir`.
#[derive(Debug, Clone)]
pub struct GitCheckout {
    dir: PathBuf,
}

impl GitCheckout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn git(&self, args: &[&str]) -> Result<String, ProvenanceError> {
        let joined = args.join(" ");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .map_err(|source| ProvenanceError::Spawn {
                args: joined.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ProvenanceError::Git {
                args: joined,
                status: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ProvenanceSource for GitCheckout {
    fn provenance(&self) -> Result<Provenance, ProvenanceError> {
        let git_hash = self.git(&["rev-parse", "HEAD"])?;
        let branch = self.git(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let status = self.git(&["status", "--porcelain", "--untracked-files=no"])?;
        debug!(
            "git provenance from {}: {} @ {}",
            self.dir.display(),
            branch,
            git_hash
        );
        Ok(Provenance {
            git_dirty: Some(!status.is_empty()),
            git_branch: branch_name(&branch),
            git_hash: Some(git_hash),
        })
    }
}

/// `rev-parse --abbrev-ref` prints `HEAD` on a detached checkout.
fn branch_name(abbrev_ref: &str) -> Option<String> {
    match abbrev_ref.trim() {
        "" | "HEAD" => None,
        name => Some(name.to_string()),
    }
}

/// Provenance from `source`, or all-null fields when it cannot be read.
pub fn resolve_or_unknown(source: &dyn ProvenanceSource) -> Provenance {
    match source.provenance() {
        Ok(provenance) => provenance,
        Err(err) => {
            warn!("version-control provenance unavailable: {}", err);
            Provenance::default()
        }
    }
}

/// `sha256:<hex>` over the compact JSON rendering of `value`.
///
/// `serde_json::Value` objects keep keys sorted, so the digest does not depend
/// on the order fields were declared in the source document.
pub fn canonical_json_digest(value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    format!("sha256:{}", hex::encode(digest))
}
