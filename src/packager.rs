//! Wire envelope packing, unpacking, and authenticity enforcement.
//!
//! ## Wire format
//!
//! Envelopes are CBOR maps.  A data packet carries
//! `{data, sig, pub, target}`: serialized block bytes, an Ed25519 signature
//! over them, the sender's public key, and the destination key (or the
//! sentinel `NOT_KNOWN` when the sender has no destination yet).  A network
//! command adds `{cmd, csig, cpub}`: the command code, its own signature,
//! and the signer's key — a broadcast command packet wraps a complete
//! genesis data packet this way.
//!
//! Decode failures surface as [`PackagerError::Decode`]; the caller decides
//! whether that is fatal for the connection.  Signature checks are computed
//! during [`unpack`] but enforced separately through [`check_verified`] so
//! callers can apply their own policy (the relay skips enforcement once a
//! channel cipher authenticates the transport).

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::crypto::{self, ChannelCipher};

/// Wire sentinel for "destination not yet known".
pub const TARGET_NOT_KNOWN: &str = "NOT_KNOWN";

/// The closed set of network control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkCommand {
    /// Merge the wrapped genesis packet's adjacency into the local view.
    Broadcast,
    /// Insert the wrapped block into the receiver's own communication chain.
    Synchronize,
}

impl NetworkCommand {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(NetworkCommand::Broadcast),
            1 => Some(NetworkCommand::Synchronize),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            NetworkCommand::Broadcast => 0,
            NetworkCommand::Synchronize => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NetworkCommand::Broadcast => "broadcast",
            NetworkCommand::Synchronize => "synchronize",
        }
    }
}

/// Destination of a packet: a known peer key or the unknown sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketTarget {
    Unknown,
    Known(String),
}

impl PacketTarget {
    pub fn from_wire(value: &str) -> Self {
        if value == TARGET_NOT_KNOWN {
            PacketTarget::Unknown
        } else {
            PacketTarget::Known(value.to_string())
        }
    }

    pub fn to_wire(&self) -> &str {
        match self {
            PacketTarget::Unknown => TARGET_NOT_KNOWN,
            PacketTarget::Known(key) => key,
        }
    }

    pub fn known(&self) -> Option<&str> {
        match self {
            PacketTarget::Unknown => None,
            PacketTarget::Known(key) => Some(key),
        }
    }
}

/// A signed command sub-object attached to a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCommand {
    pub command: NetworkCommand,
    pub csig: Vec<u8>,
    pub cpub: String,
}

/// In-memory form of a decoded wire envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub sig: Vec<u8>,
    pub sender: String,
    pub target: PacketTarget,
    pub command: Option<SignedCommand>,
}

/// CBOR representation; field names match the wire (`pub` is reserved in
/// Rust, hence the rename).
#[derive(Debug, Serialize, Deserialize)]
struct WirePacket {
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    #[serde(with = "serde_bytes")]
    sig: Vec<u8>,
    #[serde(rename = "pub")]
    sender: String,
    target: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    cmd: Option<u32>,
    #[serde(
        with = "serde_bytes",
        skip_serializing_if = "Option::is_none",
        default
    )]
    csig: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    cpub: Option<String>,
}

#[derive(Debug)]
pub enum PackagerError {
    Decode(ciborium::de::Error<std::io::Error>),
    Encode(ciborium::ser::Error<std::io::Error>),
    Authentication { sender: String },
    UnknownCommand(u32),
    IncompleteCommand,
    Crypto(crypto::CryptoError),
}

impl std::fmt::Display for PackagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackagerError::Decode(e) => write!(f, "envelope decode error: {e}"),
            PackagerError::Encode(e) => write!(f, "envelope encode error: {e}"),
            PackagerError::Authentication { sender } => {
                write!(f, "signature verification failed for {sender}")
            }
            PackagerError::UnknownCommand(value) => write!(f, "unknown command value {value}"),
            PackagerError::IncompleteCommand => {
                write!(f, "command packet is missing csig or cpub")
            }
            PackagerError::Crypto(e) => write!(f, "crypto error: {e}"),
        }
    }
}

impl std::error::Error for PackagerError {}

impl From<ciborium::de::Error<std::io::Error>> for PackagerError {
    fn from(error: ciborium::de::Error<std::io::Error>) -> Self {
        PackagerError::Decode(error)
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for PackagerError {
    fn from(error: ciborium::ser::Error<std::io::Error>) -> Self {
        PackagerError::Encode(error)
    }
}

impl From<crypto::CryptoError> for PackagerError {
    fn from(error: crypto::CryptoError) -> Self {
        PackagerError::Crypto(error)
    }
}

/// Result of [`unpack`]: verification outcomes plus the decoded packet.
#[derive(Debug)]
pub struct Unpacked {
    pub verified: bool,
    pub packet: Packet,
    /// `Some(result)` when the envelope carries a command sub-object,
    /// `None` otherwise.
    pub verified_csig: Option<bool>,
}

/// Bytes a command signature covers: the command code followed by the
/// packet data, so a command cannot be replayed onto different contents.
fn command_signing_bytes(command: NetworkCommand, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + data.len());
    bytes.extend_from_slice(&command.to_wire().to_be_bytes());
    bytes.extend_from_slice(data);
    bytes
}

/// Serialize a block into a signed wire envelope.
pub fn pack(
    signing_key: &SigningKey,
    block: &Block,
    target: &PacketTarget,
) -> Result<Vec<u8>, PackagerError> {
    let data = block.to_bytes().map_err(|_| PackagerError::Encode(
        ciborium::ser::Error::Value("block serialization failed".to_string()),
    ))?;
    let sig = crypto::sign_message(signing_key, &data);
    let sender = crypto::verifying_key_to_b64(&signing_key.verifying_key());
    let packet = Packet {
        data,
        sig,
        sender,
        target: target.clone(),
        command: None,
    };
    pack_packet(&packet)
}

/// Serialize an already-built packet (used when re-wrapping for broadcast).
pub fn pack_packet(packet: &Packet) -> Result<Vec<u8>, PackagerError> {
    let wire = WirePacket {
        data: packet.data.clone(),
        sig: packet.sig.clone(),
        sender: packet.sender.clone(),
        target: packet.target.to_wire().to_string(),
        cmd: packet.command.as_ref().map(|c| c.command.to_wire()),
        csig: packet.command.as_ref().map(|c| c.csig.clone()),
        cpub: packet.command.as_ref().map(|c| c.cpub.clone()),
    };
    let mut out = Vec::new();
    ciborium::into_writer(&wire, &mut out)?;
    Ok(out)
}

/// Decode a wire envelope and compute its verification results.
///
/// When `cipher` is present the raw bytes are decrypted first (negotiated
/// channel encryption).  Verification failures do not error here; they are
/// reported in [`Unpacked`] for the caller's policy.
pub fn unpack(raw: &[u8], cipher: Option<&ChannelCipher>) -> Result<Unpacked, PackagerError> {
    let plain;
    let bytes: &[u8] = match cipher {
        Some(cipher) => {
            plain = cipher.decrypt(raw).map_err(|_| {
                PackagerError::Decode(ciborium::de::Error::Semantic(
                    None,
                    "frame decryption failed".to_string(),
                ))
            })?;
            &plain
        }
        None => raw,
    };

    let wire: WirePacket = ciborium::from_reader(bytes)?;

    let command = match (wire.cmd, wire.csig, wire.cpub) {
        (None, None, None) => None,
        (Some(cmd), Some(csig), Some(cpub)) => {
            let command =
                NetworkCommand::from_wire(cmd).ok_or(PackagerError::UnknownCommand(cmd))?;
            Some(SignedCommand {
                command,
                csig,
                cpub,
            })
        }
        _ => return Err(PackagerError::IncompleteCommand),
    };

    let packet = Packet {
        data: wire.data,
        sig: wire.sig,
        sender: wire.sender,
        target: PacketTarget::from_wire(&wire.target),
        command,
    };

    let verified =
        crypto::verify_signature(&packet.sender, &packet.data, &packet.sig).is_ok();

    let verified_csig = packet.command.as_ref().map(|c| {
        let bytes = command_signing_bytes(c.command, &packet.data);
        crypto::verify_signature(&c.cpub, &bytes, &c.csig).is_ok()
    });

    Ok(Unpacked {
        verified,
        packet,
        verified_csig,
    })
}

/// Halt processing when a packet's signature did not verify.
pub fn check_verified(packet: &Packet, verified: bool) -> Result<(), PackagerError> {
    if verified {
        Ok(())
    } else {
        Err(PackagerError::Authentication {
            sender: packet.sender.clone(),
        })
    }
}

/// Sign raw block bytes with the local identity key.
pub fn sign_block(signing_key: &SigningKey, block_bytes: &[u8]) -> Vec<u8> {
    crypto::sign_message(signing_key, block_bytes)
}

/// Return a copy of `packet` carrying a signed command sub-object.
pub fn add_cmd(packet: &Packet, signing_key: &SigningKey, command: NetworkCommand) -> Packet {
    let bytes = command_signing_bytes(command, &packet.data);
    let csig = crypto::sign_message(signing_key, &bytes);
    let cpub = crypto::verifying_key_to_b64(&signing_key.verifying_key());
    let mut out = packet.clone();
    out.command = Some(SignedCommand {
        command,
        csig,
        cpub,
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::DEFAULT_DIFFICULTY;
    use crate::crypto::NodeKeypair;

    fn test_key() -> SigningKey {
        NodeKeypair::generate().signing_key().unwrap()
    }

    fn genesis_block() -> Block {
        let mut block = Block::genesis(b"hello".to_vec(), DEFAULT_DIFFICULTY);
        block.mine().unwrap();
        block
    }

    #[test]
    fn pack_unpack_round_trips_data_packet() {
        let key = test_key();
        let block = genesis_block();
        let raw = pack(&key, &block, &PacketTarget::Unknown).unwrap();

        let unpacked = unpack(&raw, None).unwrap();
        assert!(unpacked.verified);
        assert!(unpacked.verified_csig.is_none());
        assert_eq!(unpacked.packet.target, PacketTarget::Unknown);
        assert_eq!(
            unpacked.packet.sender,
            crypto::verifying_key_to_b64(&key.verifying_key())
        );
        assert_eq!(Block::from_bytes(&unpacked.packet.data).unwrap(), block);
    }

    #[test]
    fn tampered_data_fails_verification() {
        let key = test_key();
        let block = genesis_block();
        let raw = pack(&key, &block, &PacketTarget::Unknown).unwrap();

        let mut unpacked = unpack(&raw, None).unwrap();
        unpacked.packet.data[0] ^= 0xFF;
        assert!(
            crypto::verify_signature(
                &unpacked.packet.sender,
                &unpacked.packet.data,
                &unpacked.packet.sig
            )
            .is_err()
        );
    }

    #[test]
    fn check_verified_rejects_unverified() {
        let key = test_key();
        let block = genesis_block();
        let raw = pack(&key, &block, &PacketTarget::Unknown).unwrap();
        let unpacked = unpack(&raw, None).unwrap();

        check_verified(&unpacked.packet, true).unwrap();
        let err = check_verified(&unpacked.packet, false).unwrap_err();
        assert!(matches!(err, PackagerError::Authentication { .. }));
    }

    #[test]
    fn add_cmd_attaches_verifiable_command() {
        let sender_key = test_key();
        let relay_key = test_key();
        let block = genesis_block();
        let raw = pack(&sender_key, &block, &PacketTarget::Unknown).unwrap();
        let unpacked = unpack(&raw, None).unwrap();

        let with_cmd = add_cmd(&unpacked.packet, &relay_key, NetworkCommand::Broadcast);
        let raw_cmd = pack_packet(&with_cmd).unwrap();

        let reparsed = unpack(&raw_cmd, None).unwrap();
        assert_eq!(reparsed.verified_csig, Some(true));
        let command = reparsed.packet.command.unwrap();
        assert_eq!(command.command, NetworkCommand::Broadcast);
        assert_eq!(
            command.cpub,
            crypto::verifying_key_to_b64(&relay_key.verifying_key())
        );
        // The inner data packet still verifies against the original sender.
        assert!(reparsed.verified);
    }

    #[test]
    fn command_signature_does_not_transfer_between_commands() {
        let key = test_key();
        let block = genesis_block();
        let raw = pack(&key, &block, &PacketTarget::Unknown).unwrap();
        let unpacked = unpack(&raw, None).unwrap();

        let mut with_cmd = add_cmd(&unpacked.packet, &key, NetworkCommand::Broadcast);
        // Rewrite the command code without re-signing.
        let signed = with_cmd.command.as_mut().unwrap();
        signed.command = NetworkCommand::Synchronize;
        let raw_cmd = pack_packet(&with_cmd).unwrap();

        let reparsed = unpack(&raw_cmd, None).unwrap();
        assert_eq!(reparsed.verified_csig, Some(false));
    }

    #[test]
    fn truncated_bytes_are_a_decode_error() {
        let key = test_key();
        let block = genesis_block();
        let raw = pack(&key, &block, &PacketTarget::Unknown).unwrap();

        let err = unpack(&raw[..raw.len() / 2], None).unwrap_err();
        assert!(matches!(err, PackagerError::Decode(_)));
    }

    #[test]
    fn unpack_applies_channel_cipher() {
        let key = test_key();
        let block = genesis_block();
        let raw = pack(&key, &block, &PacketTarget::Known("peer".to_string())).unwrap();

        let channel_key = crypto::generate_channel_key();
        let cipher = ChannelCipher::new(&channel_key).unwrap();
        let encrypted = cipher.encrypt(&raw).unwrap();

        let unpacked = unpack(&encrypted, Some(&cipher)).unwrap();
        assert!(unpacked.verified);
        assert_eq!(
            unpacked.packet.target,
            PacketTarget::Known("peer".to_string())
        );

        // Without the cipher the ciphertext is garbage to the decoder.
        assert!(unpack(&encrypted, None).is_err());
    }
}
