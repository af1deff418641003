use anyhow::Context;
use lifecycle_core::{config::Config, paths, store};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing lifecycle management in: {}", root.display());

    let dir = paths::lifecycle_dir(root);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    let existed = paths::store_path(root).exists();
    store::open(root).context("failed to create the lifecycle store")?;
    if existed {
        println!("  exists:  {}", paths::STORE_FILE);
    } else {
        println!("  created: {}", paths::STORE_FILE);
    }
    Ok(())
}
