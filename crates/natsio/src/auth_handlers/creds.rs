//! Credentials files: a user JWT and an nkey seed in armored blocks.

use crate::error::{NatsError, Result};
use std::fmt;
use std::path::Path;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub jwt: String,
    pub seed: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("jwt", &self.jwt)
            .field("seed", &"<redacted>")
            .finish()
    }
}

pub async fn load_creds(path: &Path) -> Result<Credentials> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        NatsError::CredsFile(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_creds(&contents)
}

/// Extracts the first line after the `BEGIN ... JWT` and `BEGIN ... SEED`
/// markers.
pub fn parse_creds(contents: &str) -> Result<Credentials> {
    let jwt = armored_block(contents, "JWT")
        .ok_or_else(|| NatsError::CredsFile("no user JWT block found".into()))?;
    let seed = armored_block(contents, "SEED")
        .ok_or_else(|| NatsError::CredsFile("no nkey seed block found".into()))?;
    Ok(Credentials { jwt, seed })
}

fn armored_block(contents: &str, kind: &str) -> Option<String> {
    let mut lines = contents.lines().map(str::trim);
    lines.find(|line| line.starts_with("---") && line.contains("BEGIN") && line.contains(kind))?;
    lines
        .find(|line| !line.is_empty())
        .filter(|line| !line.starts_with("---"))
        .map(str::to_string)
}
