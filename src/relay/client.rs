//! A single relay session: the handshake (server-key exchange, box-sealed
//! client/server info) and the addressed send/recv calls the Prober drives.
//! See [`crate::relay::proto`] for the wire shape.

use bytes::{Bytes, BytesMut};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::{aead::Aead, ChaChaBox, PublicKey, SecretKey};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::proto::{
    self, decode_recv_packet, read_frame, write_frame, FRAME_CLIENT_INFO, FRAME_NOTE_PREFERRED,
    FRAME_RECV_PACKET, FRAME_SEND_PACKET, FRAME_SERVER_INFO, FRAME_SERVER_KEY, NONCE_LEN,
};

/// The message a freshly connected session reads first. Both sessions must
/// receive a server-info handshake message before anything else; any other
/// first message type is a protocol violation that fails the probe.
#[derive(Debug)]
pub enum FirstMessage {
    ServerInfo,
    Other(u8),
}

/// A live connection to a relay, past the handshake.
pub struct RelaySession<T> {
    transport: T,
    secret: SecretKey,
    public: PublicKey,
    peer_box: ChaChaBox,
}

impl<T> RelaySession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Performs the handshake over an already-connected transport: reads
    /// the server's public key, sends a box-sealed `ClientInfo`, then
    /// returns a session whose first subsequent `recv_first` call reads the
    /// server's `ServerInfo` reply.
    pub async fn handshake(mut transport: T) -> anyhow::Result<Self> {
        let server_key_frame = read_frame(&mut transport).await?;
        if server_key_frame.kind != FRAME_SERVER_KEY {
            anyhow::bail!("expected server-key frame, got frame type {}", server_key_frame.kind);
        }
        let server_public = parse_public_key(&server_key_frame.payload)?;

        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        let peer_box = ChaChaBox::new(&server_public, &secret);

        let nonce = crypto_box::generate_nonce(&mut OsRng);
        let sealed = peer_box
            .encrypt(&nonce, &b"client-info"[..])
            .map_err(|err| anyhow::anyhow!("failed to seal client-info: {err}"))?;

        let mut payload = BytesMut::with_capacity(proto::PUBLIC_KEY_LEN + NONCE_LEN + sealed.len());
        payload.extend_from_slice(public.as_bytes());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&sealed);
        write_frame(&mut transport, FRAME_CLIENT_INFO, &payload).await?;

        Ok(Self {
            transport,
            secret,
            public,
            peer_box,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Reads the first post-handshake message, validating it is a
    /// `ServerInfo` frame and that it decrypts under the established box.
    pub async fn recv_first(&mut self) -> anyhow::Result<FirstMessage> {
        let frame = read_frame(&mut self.transport).await?;
        if frame.kind != FRAME_SERVER_INFO {
            return Ok(FirstMessage::Other(frame.kind));
        }
        if frame.payload.len() < NONCE_LEN {
            anyhow::bail!("server-info frame too short to contain a nonce");
        }
        let (nonce_bytes, sealed) = frame.payload.split_at(NONCE_LEN);
        let nonce = GenericArray::clone_from_slice(nonce_bytes);
        self.peer_box
            .decrypt(&nonce, sealed)
            .map_err(|err| anyhow::anyhow!("failed to open server-info: {err}"))?;
        Ok(FirstMessage::ServerInfo)
    }

    /// Registers (or clears) this session as the relay's preferred path for
    /// its own public key.
    pub async fn note_preferred(&mut self, preferred: bool) -> std::io::Result<()> {
        write_frame(
            &mut self.transport,
            FRAME_NOTE_PREFERRED,
            &proto::encode_note_preferred(preferred),
        )
        .await
    }

    pub async fn send_packet(&mut self, dst: &PublicKey, data: &[u8]) -> std::io::Result<()> {
        let payload = proto::encode_send_packet(dst, data);
        write_frame(&mut self.transport, FRAME_SEND_PACKET, &payload).await
    }

    /// Reads one packet addressed to this session, returning the sender's
    /// public key and the packet body. Frames of any other type are
    /// skipped (keepalives, peer-presence notices, etc. are not modeled
    /// here since the Prober only cares about packet traffic).
    pub async fn recv_packet(&mut self) -> std::io::Result<(PublicKey, Bytes)> {
        loop {
            let frame = read_frame(&mut self.transport).await?;
            if frame.kind != FRAME_RECV_PACKET {
                continue;
            }
            let (src, body) = decode_recv_packet(frame.payload)?;
            return Ok((src, body.freeze()));
        }
    }
}

impl RelaySession<TcpStream> {
    pub async fn connect(addr: std::net::SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::handshake(stream).await
    }
}

fn parse_public_key(bytes: &[u8]) -> anyhow::Result<PublicKey> {
    if bytes.len() != proto::PUBLIC_KEY_LEN {
        anyhow::bail!("server-key frame has wrong length {}", bytes.len());
    }
    let mut arr = [0u8; proto::PUBLIC_KEY_LEN];
    arr.copy_from_slice(bytes);
    Ok(PublicKey::from(arr))
}
