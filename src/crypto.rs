//! Cryptographic primitives for the relay.
//!
//! Three concerns live here:
//! - Ed25519 signing keys identify nodes; every wire envelope carries a
//!   signature over the raw block bytes, checked against the sender's key.
//! - A per-connection symmetric channel key can be negotiated during the
//!   handshake; it is wrapped for the peer with HPKE (X25519 + HKDF-SHA256 +
//!   ChaCha20Poly1305) so only the holder of the encryption private key can
//!   recover it.
//! - [`ChannelCipher`] applies the negotiated key to whole frames with
//!   ChaCha20Poly1305, nonce prepended to the ciphertext.
//!
//! Keys travel as URL-safe base64 without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hpke::aead::ChaCha20Poly1305 as HpkeChaCha20Poly1305;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem as _, OpModeR, OpModeS, Serializable};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

pub const CHANNEL_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const SIGNATURE_SIZE: usize = 64;

/// HPKE info string binding wrapped channel keys to this protocol.
pub const CHANNEL_HPKE_INFO: &[u8] = b"meshrelay-channel-key";

#[derive(Debug)]
pub enum CryptoError {
    InvalidLength(&'static str),
    InvalidKey,
    BadSignature,
    Hpke(hpke::HpkeError),
    Aead(chacha20poly1305::aead::Error),
    Base64(base64::DecodeError),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidLength(what) => write!(f, "invalid length: {what}"),
            CryptoError::InvalidKey => write!(f, "invalid key material"),
            CryptoError::BadSignature => write!(f, "signature verification failed"),
            CryptoError::Hpke(e) => write!(f, "hpke error: {e}"),
            CryptoError::Aead(e) => write!(f, "aead error: {e}"),
            CryptoError::Base64(e) => write!(f, "base64 error: {e}"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<hpke::HpkeError> for CryptoError {
    fn from(error: hpke::HpkeError) -> Self {
        CryptoError::Hpke(error)
    }
}

impl From<chacha20poly1305::aead::Error> for CryptoError {
    fn from(error: chacha20poly1305::aead::Error) -> Self {
        CryptoError::Aead(error)
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(error: base64::DecodeError) -> Self {
        CryptoError::Base64(error)
    }
}

// ---------------------------------------------------------------------------
// Node identity (Ed25519 signing + X25519 encryption keys)
// ---------------------------------------------------------------------------

/// A node's long-lived key material, persisted as hex in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeKeypair {
    pub signing_public_key_hex: String,
    pub signing_private_key_hex: String,
    pub enc_public_key_hex: String,
    pub enc_private_key_hex: String,
}

impl NodeKeypair {
    /// Generate fresh Ed25519 signing and X25519 encryption keys.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying_key = signing_key.verifying_key();
        let (enc_private, enc_public) = X25519HkdfSha256::gen_keypair(&mut rand::rngs::OsRng);
        NodeKeypair {
            signing_public_key_hex: hex::encode(verifying_key.to_bytes()),
            signing_private_key_hex: hex::encode(signing_key.to_bytes()),
            enc_public_key_hex: hex::encode(enc_public.to_bytes()),
            enc_private_key_hex: hex::encode(enc_private.to_bytes()),
        }
    }

    pub fn signing_key(&self) -> Result<SigningKey, CryptoError> {
        let bytes =
            hex::decode(&self.signing_private_key_hex).map_err(|_| CryptoError::InvalidKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    /// The node's public signing key in the wire text form (base64).
    pub fn public_key_b64(&self) -> Result<String, CryptoError> {
        let bytes =
            hex::decode(&self.signing_public_key_hex).map_err(|_| CryptoError::InvalidKey)?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn enc_public_key_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        hex::decode(&self.enc_public_key_hex).map_err(|_| CryptoError::InvalidKey)
    }

    pub fn enc_private_key_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        hex::decode(&self.enc_private_key_hex).map_err(|_| CryptoError::InvalidKey)
    }
}

/// Sign a message with the node's signing key. Returns the 64-byte signature.
pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> Vec<u8> {
    signing_key.sign(message).to_bytes().to_vec()
}

/// Verify a signature against a base64-encoded Ed25519 public key.
pub fn verify_signature(
    public_key_b64: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key_bytes = URL_SAFE_NO_PAD.decode(public_key_b64.as_bytes())?;
    let key_bytes: [u8; 32] = key_bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey)?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| CryptoError::InvalidLength("signature must be 64 bytes"))?;
    verifying_key
        .verify_strict(message, &signature)
        .map_err(|_| CryptoError::BadSignature)
}

/// Encode a verifying key as the wire text form.
pub fn verifying_key_to_b64(key: &VerifyingKey) -> String {
    URL_SAFE_NO_PAD.encode(key.to_bytes())
}

// ---------------------------------------------------------------------------
// Channel key wrapping (HPKE)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub enc: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Generate a fresh 32-byte symmetric channel key.
pub fn generate_channel_key() -> [u8; CHANNEL_KEY_SIZE] {
    let mut key = [0u8; CHANNEL_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Wrap a channel key for the holder of the given X25519 public key.
///
/// `sender_seed` pins the ephemeral keypair for deterministic tests; pass
/// `None` in production to use the OS RNG.
pub fn wrap_channel_key(
    recipient_public_key_bytes: &[u8],
    channel_key: &[u8],
    sender_seed: Option<[u8; 32]>,
) -> Result<WrappedKey, CryptoError> {
    if channel_key.len() != CHANNEL_KEY_SIZE {
        return Err(CryptoError::InvalidLength("channel key must be 32 bytes"));
    }

    let recipient_public_key =
        <X25519HkdfSha256 as hpke::Kem>::PublicKey::from_bytes(recipient_public_key_bytes)?;

    let (encapped_key, mut sender_ctx) = if let Some(seed) = sender_seed {
        let mut rng = ChaCha20Rng::from_seed(seed);
        hpke::setup_sender::<HpkeChaCha20Poly1305, HkdfSha256, X25519HkdfSha256, _>(
            &OpModeS::Base,
            &recipient_public_key,
            CHANNEL_HPKE_INFO,
            &mut rng,
        )?
    } else {
        let mut rng = rand::rngs::OsRng;
        hpke::setup_sender::<HpkeChaCha20Poly1305, HkdfSha256, X25519HkdfSha256, _>(
            &OpModeS::Base,
            &recipient_public_key,
            CHANNEL_HPKE_INFO,
            &mut rng,
        )?
    };

    let ciphertext = sender_ctx.seal(channel_key, CHANNEL_HPKE_INFO)?;
    Ok(WrappedKey {
        enc: encapped_key.to_bytes().to_vec(),
        ciphertext,
    })
}

/// Recover a wrapped channel key with the recipient's X25519 private key.
pub fn unwrap_channel_key(
    recipient_private_key_bytes: &[u8],
    wrapped_key: &WrappedKey,
) -> Result<Vec<u8>, CryptoError> {
    let recipient_private_key =
        <X25519HkdfSha256 as hpke::Kem>::PrivateKey::from_bytes(recipient_private_key_bytes)?;
    let encapped_key =
        <X25519HkdfSha256 as hpke::Kem>::EncappedKey::from_bytes(&wrapped_key.enc)?;

    let mut receiver_ctx =
        hpke::setup_receiver::<HpkeChaCha20Poly1305, HkdfSha256, X25519HkdfSha256>(
            &OpModeR::Base,
            &recipient_private_key,
            &encapped_key,
            CHANNEL_HPKE_INFO,
        )?;

    let plaintext = receiver_ctx.open(&wrapped_key.ciphertext, CHANNEL_HPKE_INFO)?;
    Ok(plaintext)
}

// ---------------------------------------------------------------------------
// Frame encryption (negotiated channel)
// ---------------------------------------------------------------------------

/// Symmetric frame cipher installed on a beam once the handshake has
/// negotiated a channel key.  Frames carry `nonce || ciphertext`.
#[derive(Clone)]
pub struct ChannelCipher {
    key: [u8; CHANNEL_KEY_SIZE],
}

impl ChannelCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; CHANNEL_KEY_SIZE] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidLength("channel key must be 32 bytes"))?;
        Ok(ChannelCipher { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = aead.encrypt(Nonce::from_slice(&nonce_bytes), plaintext)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidLength("frame shorter than nonce"));
        }
        let (nonce_bytes, ciphertext) = frame.split_at(NONCE_SIZE);
        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        Ok(aead.decrypt(Nonce::from_slice(nonce_bytes), ciphertext)?)
    }
}
