use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

const KEY_FILE_NAME: &str = "raphael.secret";
const ENVELOPE_PREFIX: &str = "v1:";
const ENVELOPE_ALG: &str = "aes-256-gcm";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM sealer for secrets that must survive in the database (for
/// example OAuth client secrets inside the auth policy).
///
/// Key precedence: `RAPHAEL_SECRET_KEY` hashed down to 32 bytes, then the
/// on-disk key file created on first boot with mode 0600. The raw env value
/// is never written to disk.
pub struct Secrets {
    key: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u8,
    alg: String,
    iv: String,
    tag: String,
    data: String,
}

impl Secrets {
    pub fn load(data_dir: &Path, env_key: Option<&str>) -> anyhow::Result<Self> {
        if let Some(env_key) = env_key {
            let mut key = [0u8; 32];
            key.copy_from_slice(&Sha256::digest(env_key.as_bytes()));
            return Ok(Self { key });
        }

        let path = data_dir.join(KEY_FILE_NAME);
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let key: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("secret key file {} is corrupt", path.display()))?;
            return Ok(Self { key });
        }

        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        write_key_file(&path, &key)?;
        tracing::info!("created secret key file at {}", path.display());
        Ok(Self { key })
    }

    #[cfg(test)]
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Seal plaintext into the `v1:` envelope format.
    pub fn seal(&self, plaintext: &[u8]) -> anyhow::Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut iv = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut iv);

        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        // aes-gcm appends the tag to the ciphertext; the envelope keeps them apart.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        let envelope = Envelope {
            v: 1,
            alg: ENVELOPE_ALG.to_string(),
            iv: BASE64.encode(iv),
            tag: BASE64.encode(tag),
            data: BASE64.encode(sealed),
        };
        Ok(format!(
            "{ENVELOPE_PREFIX}{}",
            BASE64.encode(serde_json::to_vec(&envelope)?)
        ))
    }

    pub fn open(&self, sealed: &str) -> anyhow::Result<Vec<u8>> {
        let body = sealed
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| anyhow::anyhow!("unknown envelope version"))?;
        let envelope: Envelope = serde_json::from_slice(&BASE64.decode(body)?)?;
        if envelope.v != 1 || envelope.alg != ENVELOPE_ALG {
            anyhow::bail!(
                "unsupported envelope: v={} alg={}",
                envelope.v,
                envelope.alg
            );
        }

        let iv = BASE64.decode(&envelope.iv)?;
        if iv.len() != NONCE_LEN {
            anyhow::bail!("bad envelope iv length");
        }
        let mut ciphertext = BASE64.decode(&envelope.data)?;
        ciphertext.extend_from_slice(&BASE64.decode(&envelope.tag)?);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| anyhow::anyhow!("decryption failed"))
    }

    pub fn seal_str(&self, plaintext: &str) -> anyhow::Result<String> {
        self.seal(plaintext.as_bytes())
    }

    pub fn open_str(&self, sealed: &str) -> anyhow::Result<String> {
        Ok(String::from_utf8(self.open(sealed)?)?)
    }
}

#[cfg(unix)]
fn write_key_file(path: &Path, key: &[u8; 32]) -> anyhow::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(key)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, key: &[u8; 32]) -> anyhow::Result<()> {
    std::fs::write(path, key)?;
    Ok(())
}
