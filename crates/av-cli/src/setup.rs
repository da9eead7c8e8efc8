use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Settings;

const CONFIG_TEMPLATE: &str = r#"# agent-vault configuration
#
# Every setting can also be given as an AV_* environment variable, with
# "__" between nested keys: AV_SESSION__AUTOSAVE_INTERVAL_MS=1000

# SQLite file holding agents and sessions
database_path = "~/.config/agent-vault/vault.db"

# Selected when the chat starts. Model keys are "<provider id>:<model id>".
# default_agent_id = "..."
# default_model_key = "openai-default:gpt-5"

[session]
autosave_interval_ms = 3000
autosave_max_buffer = 20
retry_cap_ms = 15000

[tools]
# Root directory for read_note / list_notes (defaults to the working directory)
# notes_root = "~/notes"

# ── Providers ────────────────────────────────────────────────────
# A provider is usable once it is enabled and has a key, either literal
# (api_key) or read from the environment (api_key_env).

[[providers]]
id = "openai-default"
name = "OpenAI"
provider_type = "OpenAI"
api_key_env = "OPENAI_API_KEY"
enabled = true
models = [
    { display_name = "GPT-5", model_id = "gpt-5" },
    { display_name = "GPT-5 mini", model_id = "gpt-5-mini" },
]

# Any OpenAI-compatible endpoint, e.g. a local Ollama
# [[providers]]
# id = "local"
# name = "Ollama"
# provider_type = "OpenAICompatible"
# api_key = "unused"
# base_url = "http://localhost:11434/v1"
# enabled = true
# models = [{ display_name = "Llama 3", model_id = "llama3:8b" }]
"#;

pub fn run() -> Result<()> {
    let config_path = Settings::config_path()?;
    write_template(&config_path, confirm_overwrite)?;

    println!("\nNext steps:");
    println!("  1. Set your API key:   export OPENAI_API_KEY=\"sk-...\"");
    println!("  2. Create an agent:    av agents create --name Librarian --instructions \"...\"");
    println!("  3. Start chatting:     av");

    Ok(())
}

fn confirm_overwrite(path: &Path) -> Result<bool> {
    println!("Existing config file found:\n  {}", path.display());
    print!("\nOverwrite? (The existing file will be backed up) [y/N] ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Write the template to `path`, asking before replacing an existing file.
/// Returns whether the file was written.
fn write_template(path: &Path, confirm: impl FnOnce(&Path) -> Result<bool>) -> Result<bool> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    }

    if path.exists() {
        if !confirm(path)? {
            println!("Setup cancelled.");
            return Ok(false);
        }
        backup_file(path)?;
    }

    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    Ok(true)
}

/// Back up a file to <name>.bak, appending a timestamp if .bak already exists.
fn backup_file(path: &Path) -> Result<PathBuf> {
    let mut backup = path.with_extension("toml.bak");

    if backup.exists() {
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        backup = path.with_extension(format!("toml.bak.{}", timestamp));
    }

    std::fs::rename(path, &backup)
        .with_context(|| format!("Failed to back up {} to {}", path.display(), backup.display()))?;
    println!("  Backed up to {}", backup.display());

    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-vault").join("config.toml");

        assert!(write_template(&path, |_| Ok(true)).unwrap());
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.providers.len(), 1);
        assert!(settings.providers[0].enabled);
        assert_eq!(settings.session.max_buffer, 20);
    }

    #[test]
    fn test_existing_file_backed_up_or_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "database_path = \"/tmp/old.db\"").unwrap();

        assert!(!write_template(&path, |_| Ok(false)).unwrap());
        assert!(std::fs::read_to_string(&path).unwrap().contains("old.db"));

        assert!(write_template(&path, |_| Ok(true)).unwrap());
        let backup = std::fs::read_to_string(dir.path().join("config.toml.bak")).unwrap();
        assert!(backup.contains("old.db"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("[[providers]]"));
    }
}
