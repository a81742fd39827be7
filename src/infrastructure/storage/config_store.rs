//! Persistent daemon state: one JSON document plus the credential PEM pair.
//!
//! Layout under the config directory:
//!
//! ```text
//! config.json   {"identity": …, "pairedDevices": {"<device_id>": …}}
//! cert.pem      self-signed X.509
//! key.pem       PKCS#1 RSA private key
//! ```
//!
//! Writes are atomic (temp file + rename) and everything is created with
//! owner-only permissions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::{IdentityBody, PairedDeviceInfo};
use crate::error::{DaemonError, Result};
use crate::infrastructure::security::Credentials;

const CONFIG_FILE: &str = "config.json";
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Contents of `config.json`.
#[derive(Debug, Clone, Serialize)]
pub struct StoredConfig {
    pub identity: IdentityBody,
    #[serde(rename = "pairedDevices")]
    pub paired_devices: HashMap<String, PairedDeviceInfo>,
}

pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load `config.json`. `Ok(None)` when it does not exist yet; paired
    /// records in the pre-address schema (bare identity objects) are
    /// migrated on the fly.
    pub fn load_config(&self) -> Result<Option<StoredConfig>> {
        let path = self.dir.join(CONFIG_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DaemonError::persistence(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };

        let raw: Value = serde_json::from_slice(&data)
            .map_err(|e| DaemonError::persistence(format!("parse {}: {e}", path.display())))?;
        let identity: IdentityBody = raw
            .get("identity")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| DaemonError::persistence(format!("bad identity in config: {e}")))?
            .ok_or_else(|| DaemonError::persistence("config has no identity"))?;

        let mut paired_devices = HashMap::new();
        if let Some(Value::Object(entries)) = raw.get("pairedDevices") {
            for (device_id, entry) in entries {
                match parse_paired_entry(entry) {
                    Some(info) => {
                        paired_devices.insert(device_id.clone(), info);
                    }
                    None => {
                        warn!(device_id = %device_id, "dropping unreadable paired record");
                    }
                }
            }
        }

        Ok(Some(StoredConfig {
            identity,
            paired_devices,
        }))
    }

    /// Atomically rewrite `config.json`.
    pub fn save_config(
        &self,
        identity: &IdentityBody,
        paired_devices: &HashMap<String, PairedDeviceInfo>,
    ) -> Result<()> {
        self.ensure_dir()?;
        let config = StoredConfig {
            identity: identity.clone(),
            paired_devices: paired_devices.clone(),
        };
        let data = serde_json::to_vec_pretty(&config)
            .map_err(|e| DaemonError::persistence(format!("encode config: {e}")))?;
        self.write_atomic(CONFIG_FILE, &data)
    }

    /// Load the credential PEM pair; `Ok(None)` when either file is missing,
    /// which triggers regeneration at startup.
    pub fn load_credentials(&self) -> Result<Option<Credentials>> {
        let cert_path = self.dir.join(CERT_FILE);
        let key_path = self.dir.join(KEY_FILE);
        let cert_pem = match fs::read_to_string(&cert_path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DaemonError::persistence(format!(
                    "read {}: {e}",
                    cert_path.display()
                )))
            }
        };
        let key_pem = match fs::read_to_string(&key_path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DaemonError::persistence(format!(
                    "read {}: {e}",
                    key_path.display()
                )))
            }
        };
        Credentials::from_pem(&cert_pem, &key_pem).map(Some)
    }

    pub fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        self.ensure_dir()?;
        self.write_atomic(CERT_FILE, credentials.cert_pem().as_bytes())?;
        self.write_atomic(KEY_FILE, credentials.key_pem().as_bytes())?;
        info!(dir = %self.dir.display(), "credentials persisted");
        Ok(())
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| DaemonError::persistence(format!("create {}: {e}", self.dir.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700));
        }
        Ok(())
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));

        fs::write(&tmp, data)
            .map_err(|e| DaemonError::persistence(format!("write {}: {e}", tmp.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
        }
        fs::rename(&tmp, &path)
            .map_err(|e| DaemonError::persistence(format!("rename to {}: {e}", path.display())))
    }
}

/// Current schema carries `{identity, lastIP, lastPort, certSha256}`; the
/// older one stored the identity object directly.
fn parse_paired_entry(entry: &Value) -> Option<PairedDeviceInfo> {
    if entry.get("identity").is_some() {
        return serde_json::from_value(entry.clone()).ok();
    }
    let identity: IdentityBody = serde_json::from_value(entry.clone()).ok()?;
    Some(PairedDeviceInfo {
        identity,
        last_ip: String::new(),
        last_port: 0,
        cert_sha256: None,
    })
}
