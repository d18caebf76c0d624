//! Durable YAML representation of the whitelist.
//!
//! ```yaml
//! endpoints:
//!   - /api/config
//!   - /api/states/{entity_id}
//! entities:
//!   - light.*
//!   - sensor.temp
//! ```
//!
//! Both keys are optional. Entries are written sorted and deduplicated so the
//! file diffs cleanly between learn runs.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{Whitelist, WhitelistError};
use crate::pattern::{EndpointTemplate, EntityPattern};

/// On-disk document shape.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistFile {
    pub endpoints: Vec<String>,
    pub entities: Vec<String>,
}

impl WhitelistFile {
    /// Parse a YAML document. Blank input is an empty whitelist.
    pub fn from_yaml(path: &Path, contents: &str) -> Result<Self, WhitelistError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_saphyr::from_str(contents).map_err(|e| WhitelistError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> Result<String, WhitelistError> {
        serde_saphyr::to_string(self).map_err(|e| WhitelistError::Serialize(e.to_string()))
    }
}

impl From<&Whitelist> for WhitelistFile {
    fn from(whitelist: &Whitelist) -> Self {
        let mut endpoints: Vec<String> = whitelist
            .endpoints()
            .iter()
            .map(EndpointTemplate::to_source)
            .collect();
        endpoints.sort();
        endpoints.dedup();

        let mut entities: Vec<String> = whitelist.entities().iter().map(|e| e.to_string()).collect();
        entities.sort();
        entities.dedup();

        Self {
            endpoints,
            entities,
        }
    }
}

impl From<WhitelistFile> for Whitelist {
    fn from(file: WhitelistFile) -> Self {
        let mut whitelist = Whitelist::new();
        for endpoint in &file.endpoints {
            whitelist.insert_endpoint(EndpointTemplate::parse(endpoint));
        }
        for entity in &file.entities {
            whitelist.insert_entity(EntityPattern::parse(entity));
        }
        whitelist
    }
}

/// Load a whitelist from `path`. A missing file yields an empty whitelist.
pub fn load(path: &Path) -> Result<Whitelist, WhitelistError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Whitelist::new()),
        Err(source) => {
            return Err(WhitelistError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    WhitelistFile::from_yaml(path, &contents).map(Whitelist::from)
}

/// Save `whitelist` to `path` atomically.
pub fn save(path: &Path, whitelist: &Whitelist) -> Result<(), WhitelistError> {
    let yaml = WhitelistFile::from(whitelist).to_yaml()?;
    atomic_write(path, yaml.as_bytes()).map_err(|source| WhitelistError::Persist {
        path: path.to_path_buf(),
        source,
    })
}

/// Write content atomically using temp-file + rename.
///
/// The temp file sits next to the target so the rename stays on one
/// filesystem. On failure the temp file is removed best-effort.
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = std::path::PathBuf::from(temp_name);

    let written = std::fs::File::create(&temp_path).and_then(|mut f| {
        f.write_all(content)?;
        f.sync_all()
    });
    if let Err(e) = written.and_then(|()| std::fs::rename(&temp_path, path)) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}
