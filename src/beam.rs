//! The secure channel wrapping one accepted socket.
//!
//! A `Beam` owns the framed TCP stream plus the two chains that ride on it:
//! `conn_bc`, this node's own ledger for the connection (broadcast blocks
//! are mined onto it), and `comm_bc`, the per-peer-pair communication
//! ledger that relayed blocks append to.  Frames are length-prefixed with a
//! u32 big-endian header.
//!
//! If the genesis announcement carries an X25519 encryption key, the beam
//! answers with a handshake block wrapping a fresh channel key (HPKE) and
//! installs a [`ChannelCipher`] for subsequent frames.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::beacon::{BeaconStore, StoreError};
use crate::block::{Block, BlockError, Chain};
use crate::crypto::{self, ChannelCipher, CryptoError, NodeKeypair};
use crate::logging;
use crate::mlog;
use crate::packager::{self, PacketTarget, PackagerError};

/// Upper bound on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum BeamError {
    Io(std::io::Error),
    FrameTooLarge(usize),
    ConnectionClosed,
    Block(BlockError),
    Packager(PackagerError),
    Crypto(CryptoError),
    Store(StoreError),
}

impl std::fmt::Display for BeamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BeamError::Io(e) => write!(f, "io error: {e}"),
            BeamError::FrameTooLarge(size) => write!(f, "frame of {size} bytes exceeds limit"),
            BeamError::ConnectionClosed => write!(f, "connection closed by peer"),
            BeamError::Block(e) => write!(f, "block error: {e}"),
            BeamError::Packager(e) => write!(f, "packager error: {e}"),
            BeamError::Crypto(e) => write!(f, "crypto error: {e}"),
            BeamError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for BeamError {}

impl From<std::io::Error> for BeamError {
    fn from(e: std::io::Error) -> Self {
        BeamError::Io(e)
    }
}

impl From<BlockError> for BeamError {
    fn from(e: BlockError) -> Self {
        BeamError::Block(e)
    }
}

impl From<PackagerError> for BeamError {
    fn from(e: PackagerError) -> Self {
        BeamError::Packager(e)
    }
}

impl From<CryptoError> for BeamError {
    fn from(e: CryptoError) -> Self {
        BeamError::Crypto(e)
    }
}

impl From<StoreError> for BeamError {
    fn from(e: StoreError) -> Self {
        BeamError::Store(e)
    }
}

/// Read one length-prefixed frame.  `Ok(None)` means the peer closed the
/// connection cleanly before the next frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, BeamError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(BeamError::FrameTooLarge(len));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), BeamError> {
    let len = u32::try_from(bytes.len()).map_err(|_| BeamError::FrameTooLarge(bytes.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Payload of a genesis block when the sender wants channel encryption.
/// Plain genesis payloads that do not decode as this remain opaque data.
#[derive(Debug, Serialize, Deserialize)]
pub struct GenesisAnnouncement {
    #[serde(with = "serde_bytes")]
    pub enc_pub_key: Vec<u8>,
    pub new_diff: u32,
}

/// Handshake reply carrying the HPKE-wrapped channel key.
#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub status: String,
    #[serde(with = "serde_bytes")]
    pub enc: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
}

pub const HANDSHAKE_CONNECTED: &str = "CONNECTED";

pub struct Beam {
    stream: TcpStream,
    peer_addr: SocketAddr,
    keypair: NodeKeypair,
    store: BeaconStore,
    /// This node's public signing key in wire form.
    pub pub_key: String,
    pub target_key: PacketTarget,
    pub alive: bool,
    locked: bool,
    /// This node's own ledger for the connection.
    pub conn_bc: Chain,
    /// The per-peer-pair communication ledger.
    pub comm_bc: Chain,
    pub encryptor_relay: Option<ChannelCipher>,
    pub encryptor_beacon: Option<ChannelCipher>,
}

impl Beam {
    /// Wrap an accepted socket.  The chains stay empty until
    /// [`initialize_incoming_transmission`](Self::initialize_incoming_transmission).
    pub fn from_socket(
        stream: TcpStream,
        keypair: NodeKeypair,
        store: BeaconStore,
        target_key: PacketTarget,
    ) -> Result<Self, BeamError> {
        let peer_addr = stream.peer_addr()?;
        let pub_key = keypair.public_key_b64()?;
        Ok(Beam {
            stream,
            peer_addr,
            keypair,
            store,
            pub_key,
            target_key,
            alive: false,
            locked: false,
            conn_bc: Chain::new(),
            comm_bc: Chain::new(),
            encryptor_relay: None,
            encryptor_beacon: None,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, BeamError> {
        read_frame(&mut self.stream).await
    }

    pub async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), BeamError> {
        write_frame(&mut self.stream, bytes).await
    }

    /// Accept the first block of an incoming transmission.
    ///
    /// Seeds `conn_bc` and `comm_bc` with the block and, when the genesis
    /// payload announces an encryption key, negotiates the channel cipher by
    /// replying with a handshake block.  Sets `alive` on success.
    pub async fn initialize_incoming_transmission(
        &mut self,
        block: Block,
    ) -> Result<(), BeamError> {
        self.conn_bc.seed(block.clone());
        // Communication ledger starts from the same first block.
        self.comm_bc.seed(block.clone());
        self.alive = true;

        if block.index == 0 {
            if let Ok(announcement) =
                ciborium::from_reader::<GenesisAnnouncement, _>(block.data.as_slice())
            {
                self.conn_bc.difficulty = announcement.new_diff;
                self.negotiate_encryption(&announcement.enc_pub_key).await?;
            }
        }
        Ok(())
    }

    /// Wrap a fresh channel key for the peer and send the handshake reply
    /// as the next block of `conn_bc`.
    async fn negotiate_encryption(&mut self, peer_enc_key: &[u8]) -> Result<(), BeamError> {
        let channel_key = crypto::generate_channel_key();
        let wrapped = crypto::wrap_channel_key(peer_enc_key, &channel_key, None)?;

        let reply = HandshakeReply {
            status: HANDSHAKE_CONNECTED.to_string(),
            enc: wrapped.enc,
            key: wrapped.ciphertext,
        };
        let mut reply_bytes = Vec::new();
        ciborium::into_writer(&reply, &mut reply_bytes).map_err(BlockError::from)?;

        let mut handshake_block = self
            .conn_bc
            .template_next_block(self.conn_bc.difficulty, reply_bytes)?;
        handshake_block.mine()?;
        self.conn_bc.insert(handshake_block.clone())?;

        let signing_key = self.keypair.signing_key()?;
        let raw = packager::pack(&signing_key, &handshake_block, &self.target_key)?;
        self.write_frame(&raw).await?;

        self.encryptor_relay = Some(ChannelCipher::new(&channel_key)?);
        mlog!(
            "beam: channel encryption enabled for {}",
            logging::peer_key(self.target_key.to_wire())
        );
        Ok(())
    }

    /// The cipher to apply to inbound frames, once negotiated.
    pub fn inbound_cipher(&self) -> Option<&ChannelCipher> {
        self.encryptor_relay
            .as_ref()
            .or(self.encryptor_beacon.as_ref())
    }

    pub fn encryption_negotiated(&self) -> bool {
        self.encryptor_relay.is_some() || self.encryptor_beacon.is_some()
    }

    /// Record an acknowledged peer key in the store.
    pub fn save_new_pub_key(
        &self,
        pub_key: &str,
        can_encrypt: bool,
        description: &str,
    ) -> Result<(), BeamError> {
        self.store.save_known_key(pub_key, can_encrypt, description)?;
        Ok(())
    }

    pub async fn close(&mut self) {
        self.alive = false;
        let _ = self.stream.shutdown().await;
    }
}
