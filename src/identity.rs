//! Device key pair used to claim a number from the directory.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::IdentityError;

const DEVICE_ID_LEN: usize = 20;

pub struct DeviceIdentity {
    signing_key: SigningKey,
}

impl DeviceIdentity {
    /// Loads the key at `path`, or creates one there on first use.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            info!(path = %path.display(), "loading device key");
            Self::load(path)
        } else {
            info!(path = %path.display(), "creating device key");
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }

    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    fn load(path: &Path) -> Result<Self, IdentityError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim())?;

        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength(bytes.len()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key),
        })
    }

    fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    /// First 20 hex digits of SHA-256 over the public key.
    pub fn device_id(&self) -> String {
        let digest = Sha256::digest(self.public_key_bytes());

        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            let _ = write!(hex, "{byte:02x}");
        }

        hex.truncate(DEVICE_ID_LEN);
        hex
    }
}
