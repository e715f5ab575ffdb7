// Last connected server
// Remembered across daemon restarts so a disconnect can still end the remote session

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::config_dir;
use crate::types::{Server, ServerTier};

/// Persisted subset of a server descriptor (the load is not kept)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct LastServer {
    id: String,
    name: String,
    #[serde(rename = "type")]
    tier: ServerTier,
    country: String,
    city: String,
}

impl From<&Server> for LastServer {
    fn from(server: &Server) -> Self {
        Self {
            id: server.id.clone(),
            name: server.name.clone(),
            tier: server.tier,
            country: server.country.clone(),
            city: server.city.clone(),
        }
    }
}

impl From<LastServer> for Server {
    fn from(last: LastServer) -> Self {
        Self {
            id: last.id,
            name: last.name,
            tier: last.tier,
            country: last.country,
            city: last.city,
            load: 0.0,
        }
    }
}

/// Default location: `~/.config/dicyvpn/last-server.toml`
pub fn last_server_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("last-server.toml"))
}

/// Load the last server, `None` when nothing was saved
pub fn load_last_server(path: &Path) -> Result<Option<Server>> {
    if !path.exists() {
        debug!("No last server at {}", path.display());
        return Ok(None);
    }

    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let last: LastServer =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(Some(last.into()))
}

/// Save a server as the last connected one
pub fn save_last_server(path: &Path, server: &Server) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let contents =
        toml::to_string_pretty(&LastServer::from(server)).context("Failed to serialize last server")?;
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;

    debug!("Saved last server {} to {}", server.id, path.display());
    Ok(())
}

/// Forget the last server
pub fn clear_last_server(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server() -> Server {
        Server {
            id: "DE_01".to_string(),
            name: "Frankfurt #1".to_string(),
            tier: ServerTier::Primary,
            country: "DE".to_string(),
            city: "Frankfurt".to_string(),
            load: 0.73,
        }
    }

    #[test]
    fn test_save_and_load_resets_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("last-server.toml");

        save_last_server(&path, &server()).unwrap();
        let loaded = load_last_server(&path).unwrap().unwrap();

        assert_eq!(loaded.id, "DE_01");
        assert_eq!(loaded.tier, ServerTier::Primary);
        assert_eq!(loaded.city, "Frankfurt");
        assert_eq!(loaded.load, 0.0);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("type = \"primary\""));
        assert!(!contents.contains("load"));
    }

    #[test]
    fn test_missing_and_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last-server.toml");

        assert!(load_last_server(&path).unwrap().is_none());
        clear_last_server(&path).unwrap();

        save_last_server(&path, &server()).unwrap();
        clear_last_server(&path).unwrap();
        assert!(load_last_server(&path).unwrap().is_none());
    }
}
