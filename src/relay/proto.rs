//! A minimal framed wire protocol for opening a relay session and
//! exchanging packets through it, modeling the shape of the real DERP
//! protocol (server-key exchange, box-sealed client/server info, addressed
//! send/recv frames). The real relay protocol's client library is treated
//! as an external collaborator reachable only over the network; no crate
//! on crates.io exposes it standalone, so this module is the minimal
//! stand-in the Prober drives — it only needs to satisfy the black-box
//! contract of opening a session and sending/receiving packets, not
//! interoperate with a specific third-party wire format.
//!
//! Frame shape: one type byte, a big-endian `u32` payload length, then the
//! payload.

use bytes::{Buf, BufMut, BytesMut};
use crypto_box::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_SERVER_KEY: u8 = 0x01;
pub const FRAME_CLIENT_INFO: u8 = 0x02;
pub const FRAME_SERVER_INFO: u8 = 0x03;
pub const FRAME_SEND_PACKET: u8 = 0x04;
pub const FRAME_RECV_PACKET: u8 = 0x05;
pub const FRAME_NOTE_PREFERRED: u8 = 0x07;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// A decoded frame header plus its raw payload.
#[derive(Debug)]
pub struct Frame {
    pub kind: u8,
    pub payload: BytesMut,
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, kind: u8, payload: &[u8]) -> std::io::Result<()> {
    w.write_u8(kind).await?;
    w.write_u32(payload.len() as u32).await?;
    w.write_all(payload).await?;
    w.flush().await
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Frame> {
    let kind = r.read_u8().await?;
    let len = r.read_u32().await? as usize;
    let mut payload = BytesMut::zeroed(len);
    r.read_exact(&mut payload).await?;
    Ok(Frame { kind, payload })
}

/// Encodes a `SendPacket` frame's payload: the destination's public key
/// followed by the packet body.
pub fn encode_send_packet(dst: &PublicKey, data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PUBLIC_KEY_LEN + data.len());
    buf.put_slice(dst.as_bytes());
    buf.put_slice(data);
    buf
}

/// Decodes a `RecvPacket` frame's payload into the sender's public key and
/// the packet body. A length mismatch between what the sender declared it
/// sent and what actually arrived is tolerated by the caller, not this
/// decoder — this function only needs the frame to be long enough to
/// contain a public key.
pub fn decode_recv_packet(mut payload: BytesMut) -> std::io::Result<(PublicKey, BytesMut)> {
    if payload.len() < PUBLIC_KEY_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "recv_packet frame shorter than a public key",
        ));
    }
    let key_bytes = payload.split_to(PUBLIC_KEY_LEN);
    let mut key_arr = [0u8; PUBLIC_KEY_LEN];
    key_arr.copy_from_slice(&key_bytes);
    Ok((PublicKey::from(key_arr), payload))
}

pub fn encode_note_preferred(preferred: bool) -> [u8; 1] {
    [preferred as u8]
}

pub fn buf_remaining_to_vec(mut buf: BytesMut) -> Vec<u8> {
    let mut out = vec![0u8; buf.len()];
    buf.copy_to_slice(&mut out);
    out
}
