//! # Config Commands

use anyhow::{bail, Context, Result};
use mindlog_core::{Config, ConfigLoader};

use super::success;

/// Print the effective configuration with secrets masked
pub fn show(config: &Config, json: bool) -> Result<()> {
    let masked = masked(config);
    if json {
        println!("{}", serde_json::to_string_pretty(&masked)?);
    } else {
        let rendered = toml::to_string_pretty(&masked).context("Failed to render configuration")?;
        print!("{}", rendered);
    }
    Ok(())
}

fn masked(config: &Config) -> Config {
    let mut config = config.clone();
    if !config.remote.api_key.is_empty() {
        config.remote.api_key = "********".to_string();
    }
    if config.remote.access_token.is_some() {
        config.remote.access_token = Some("********".to_string());
    }
    config
}

/// Write the default template to the loader's path
pub fn init(loader: &ConfigLoader, force: bool) -> Result<()> {
    let path = loader.config_path();
    if path.exists() && !force {
        bail!(
            "{} already exists, pass --force to overwrite",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, loader.create_template()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("{}", success(&format!("Wrote {}", path.display())));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_hides_secrets() {
        let mut config = Config::default();
        config.remote.api_key = "anon-key".to_string();
        config.remote.access_token = Some("jwt".to_string());

        let masked = masked(&config);
        assert_eq!(masked.remote.api_key, "********");
        assert_eq!(masked.remote.access_token.as_deref(), Some("********"));
        assert_eq!(masked.sync, config.sync);
    }

    #[test]
    fn test_init_writes_loadable_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mindlog.toml");
        let loader = ConfigLoader::with_path(&path).env_prefix("MINDLOG_CLI_TEST");

        init(&loader, false).unwrap();
        assert!(path.exists());
        assert!(init(&loader, false).is_err());
        init(&loader, true).unwrap();

        let loaded = loader.load().unwrap();
        assert_eq!(loaded.sync, Config::default().sync);
    }
}
