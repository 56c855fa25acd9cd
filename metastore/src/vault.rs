use anyhow::{anyhow, bail, Context, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use std::path::Path;

const KEY_LEN: usize = 32;

/// Seals and opens connection secrets with AES-256-GCM.
///
/// The key is generated on first use and persisted next to the metadata
/// store. Sealed payloads are `nonce || ciphertext || tag`; a fresh random
/// nonce is drawn for every seal.
pub struct Vault {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Vault {
    /// Loads the key from `key_path`, creating and persisting a new one
    /// (0600 on unix) when the file does not exist yet.
    pub fn load_or_create(key_path: &Path) -> Result<Self> {
        let rng = SystemRandom::new();
        let key_bytes = if key_path.exists() {
            let bytes = std::fs::read(key_path)
                .with_context(|| format!("reading vault key {}", key_path.display()))?;
            if bytes.len() != KEY_LEN {
                bail!("vault key {} has the wrong size", key_path.display());
            }
            bytes
        } else {
            let mut bytes = vec![0u8; KEY_LEN];
            rng.fill(&mut bytes)
                .map_err(|_| anyhow!("generating vault key material"))?;
            write_key_file(key_path, &bytes)
                .with_context(|| format!("persisting vault key {}", key_path.display()))?;
            bytes
        };
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| anyhow!("loading vault key material"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng,
        })
    }

    /// Encrypts `plaintext`, returning the sealed payload.
    pub fn seal(&self, plaintext: &str) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow!("generating nonce"))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("sealing credential"))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    /// Decrypts a payload produced by [`Vault::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<String> {
        if sealed.len() < NONCE_LEN {
            bail!("sealed payload is too short");
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| anyhow!("reading nonce"))?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("opening sealed credential"))?;
        String::from_utf8(plaintext.to_vec()).context("sealed credential is not valid utf-8")
    }
}

#[cfg(unix)]
fn write_key_file(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}
