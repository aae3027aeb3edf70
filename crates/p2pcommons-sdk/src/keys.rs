//! Module key pairs.
//!
//! A module key is the ed25519 public key of the pair; whoever holds the
//! secret half can append to the module's drive. Secrets are stored one file
//! per module under the settings `keys` directory, named by hex public key.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use p2pcommons_meta::HyperKey;

use crate::error::DriveError;

/// Secret and public key of one module.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generates a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// Returns the module key.
    pub fn public(&self) -> HyperKey {
        HyperKey::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs `message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Path of the secret file for `key` inside `dir`.
    pub fn path_for(dir: &Path, key: &HyperKey) -> PathBuf {
        dir.join(key.to_hex())
    }

    /// Writes the secret key to `dir`, readable by the owner only.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, DriveError> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, &self.public());
        fs::write(&path, self.signing_key.to_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(path)
    }

    /// Loads the secret for `key` from `dir`, if this peer holds it.
    pub fn load(dir: &Path, key: &HyperKey) -> Result<Option<Self>, DriveError> {
        let path = Self::path_for(dir, key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let secret: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            DriveError::Key(format!(
                "secret key file {} has {} bytes, expected {}",
                path.display(),
                bytes.len(),
                SECRET_KEY_LENGTH
            ))
        })?;
        let pair = Self {
            signing_key: SigningKey::from_bytes(&secret),
        };
        if pair.public() != *key {
            return Err(DriveError::Key(format!(
                "secret key file {} does not belong to {}",
                path.display(),
                key
            )));
        }
        Ok(Some(pair))
    }

    /// Removes the stored secret for `key`, if any.
    pub fn remove(dir: &Path, key: &HyperKey) -> Result<(), DriveError> {
        let path = Self::path_for(dir, key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Checks a signature made by the holder of `key`.
pub fn verify(key: &HyperKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(key.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(KeyPair::generate().public(), KeyPair::generate().public());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let pair = KeyPair::generate();
        let path = pair.save(dir.path()).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = KeyPair::load(dir.path(), &pair.public()).unwrap().unwrap();
        assert_eq!(loaded.public(), pair.public());
        assert!(KeyPair::load(dir.path(), &KeyPair::generate().public())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_sign_verify() {
        let pair = KeyPair::generate();
        let sig = pair.sign(b"entry");
        assert!(verify(&pair.public(), b"entry", &sig));
        assert!(!verify(&pair.public(), b"other", &sig));
        assert!(!verify(&KeyPair::generate().public(), b"entry", &sig));
    }

    #[test]
    fn test_corrupt_secret_rejected() {
        let dir = TempDir::new().unwrap();
        let key = KeyPair::generate().public();
        fs::write(KeyPair::path_for(dir.path(), &key), b"short").unwrap();
        assert!(matches!(
            KeyPair::load(dir.path(), &key),
            Err(DriveError::Key(_))
        ));
    }
}
