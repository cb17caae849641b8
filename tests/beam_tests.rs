use tokio::net::{TcpListener, TcpStream};

use meshrelay::beacon::BeaconStore;
use meshrelay::beam::{
    read_frame, write_frame, BeamError, GenesisAnnouncement, HandshakeReply, MAX_FRAME_SIZE,
    HANDSHAKE_CONNECTED,
};
use meshrelay::block::{Block, Chain, DEFAULT_DIFFICULTY};
use meshrelay::crypto::{self, ChannelCipher, NodeKeypair, WrappedKey};
use meshrelay::packager::{self, PacketTarget};
use meshrelay::relay::{Relay, RelayConfig, RelayContext};

#[tokio::test]
async fn frames_round_trip_over_a_stream() {
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    write_frame(&mut client, b"first").await.expect("write");
    write_frame(&mut client, &[]).await.expect("write empty");
    write_frame(&mut client, &vec![0xAB; 4096])
        .await
        .expect("write large");

    assert_eq!(read_frame(&mut server).await.expect("read").unwrap(), b"first");
    assert_eq!(
        read_frame(&mut server).await.expect("read").unwrap(),
        Vec::<u8>::new()
    );
    assert_eq!(
        read_frame(&mut server).await.expect("read").unwrap(),
        vec![0xAB; 4096]
    );

    drop(client);
    assert!(read_frame(&mut server).await.expect("eof").is_none());
}

#[tokio::test]
async fn oversized_frame_header_is_rejected() {
    let (mut client, mut server) = tokio::io::duplex(64);

    let bogus = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
    tokio::io::AsyncWriteExt::write_all(&mut client, &bogus)
        .await
        .expect("write header");

    let err = read_frame(&mut server).await.unwrap_err();
    assert!(matches!(err, BeamError::FrameTooLarge(_)));
}

#[tokio::test]
async fn encrypted_channel_is_negotiated_from_a_genesis_announcement() {
    let store = BeaconStore::open_in_memory().expect("open store");
    let keypair = store.load_or_create_identity().expect("create identity");
    let relay_pub = keypair.public_key_b64().expect("relay pub");
    let ctx = RelayContext::new(store, keypair, RelayConfig::default());
    let queues = ctx.publisher.queues().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        let mut relay = Relay::accept(socket, ctx).await.expect("handshake");
        let size = relay.do_relaying().await;
        (relay, size)
    });

    let client = NodeKeypair::generate();
    let client_signing = client.signing_key().expect("client key");
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    // Genesis whose payload asks for channel encryption.
    let announcement = GenesisAnnouncement {
        enc_pub_key: client.enc_public_key_bytes().expect("enc key"),
        new_diff: DEFAULT_DIFFICULTY,
    };
    let mut payload = Vec::new();
    ciborium::into_writer(&announcement, &mut payload).expect("encode announcement");
    let mut genesis = Block::genesis(payload, DEFAULT_DIFFICULTY);
    genesis.mine().expect("mine genesis");
    let mut local_chain = Chain::new();
    local_chain.insert(genesis.clone()).expect("local genesis");

    let raw = packager::pack(&client_signing, &genesis, &PacketTarget::Unknown)
        .expect("pack genesis");
    write_frame(&mut socket, &raw).await.expect("send genesis");

    // The reply block carries the wrapped channel key.
    let reply_frame = read_frame(&mut socket)
        .await
        .expect("read reply")
        .expect("reply frame");
    let unpacked = packager::unpack(&reply_frame, None).expect("unpack reply");
    assert_eq!(unpacked.packet.sender, relay_pub);
    let reply_block = Block::from_bytes(&unpacked.packet.data).expect("reply block");
    assert_eq!(reply_block.index, 1);
    let reply: HandshakeReply =
        ciborium::from_reader(reply_block.data.as_slice()).expect("decode reply");
    assert_eq!(reply.status, HANDSHAKE_CONNECTED);

    let channel_key = crypto::unwrap_channel_key(
        &client.enc_private_key_bytes().expect("private key"),
        &WrappedKey {
            enc: reply.enc,
            ciphertext: reply.key,
        },
    )
    .expect("unwrap channel key");
    let cipher = ChannelCipher::new(&channel_key).expect("cipher");

    // A chained block addressed to the relay, sent encrypted.
    let mut block = local_chain
        .template_next_block(DEFAULT_DIFFICULTY, b"secret".to_vec())
        .expect("template");
    block.mine().expect("mine block");
    let plain = packager::pack(
        &client_signing,
        &block,
        &PacketTarget::Known(relay_pub.clone()),
    )
    .expect("pack block");
    let encrypted = cipher.encrypt(&plain).expect("encrypt frame");
    write_frame(&mut socket, &encrypted).await.expect("send frame");

    let (relay, size) = server.await.expect("server task");
    assert!(relay.is_alive());
    assert_eq!(size, encrypted.len());
    assert!(relay.beam().encryption_negotiated());

    let mut rx = queues
        .take_receiver(&relay_pub)
        .await
        .expect("local queue");
    assert_eq!(rx.try_recv().expect("delivered"), encrypted);
}
