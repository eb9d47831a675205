//! `hivemind init`: write the project configuration scaffold.

use anyhow::{bail, Context, Result};
use std::path::Path;

const CONFIG_TEMPLATE: &str = "\
database:
  url: .hivemind/hivemind.db
  # global_path: ~/.config/hivemind/hivemind.db

embedder:
  host: http://127.0.0.1:11434
  model: mxbai-embed-large
  timeout_ms: 10000

http:
  host: 127.0.0.1
  port: 9800

logging:
  level: info
  format: pretty

# Comma-separated debug namespaces, e.g. \"swarm:*\" or \"swarm:events\".
debug_namespaces: \"\"
";

pub async fn handle_init(force: bool) -> Result<()> {
    let dir = Path::new(".hivemind");
    let config_path = dir.join("config.yaml");

    if config_path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config_path.display());
    }

    std::fs::create_dir_all(dir).context("failed to create .hivemind/")?;
    std::fs::write(&config_path, CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    println!("wrote {}", config_path.display());
    Ok(())
}
