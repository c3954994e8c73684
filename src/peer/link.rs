/**
 * peer/link.rs
 *
 * Encrypted, framed link carrying every data channel of a peer connection
 */

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::net::Endpoint;
use crate::peer::data_channel::ChannelInner;
use crate::peer::obfuscation::Obfuscator;
use crate::peer::types::{ConnectionAddresses, Role};

/// Largest payload carried by one frame; larger messages are split
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Upper bound on a record as read off the wire
const MAX_RECORD_SIZE: usize = 64 * 1024;

/// AES-GCM tag length
const TAG_SIZE: usize = 16;

const HELLO_MAGIC: &[u8] = b"peersocks-hello";

const CONTEXT_CONTROLLING: &str = "peersocks 2024-06 link key controlling to controlled";
const CONTEXT_CONTROLLED: &str = "peersocks 2024-06 link key controlled to controlling";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameType {
    Hello = 0,
    HelloAck = 1,
    Open = 2,
    OpenAck = 3,
    Binary = 4,
    Text = 5,
    Close = 6,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => FrameType::Hello,
            1 => FrameType::HelloAck,
            2 => FrameType::Open,
            3 => FrameType::OpenAck,
            4 => FrameType::Binary,
            5 => FrameType::Text,
            6 => FrameType::Close,
            other => return Err(Error::protocol(format!("unknown frame type {}", other))),
        })
    }
}

/// One link frame: `type(1) | channel(2) | payload`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub kind: FrameType,
    pub channel: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel,
            payload: payload.into(),
        }
    }

    pub fn control(kind: FrameType, channel: u16) -> Self {
        Self::new(kind, channel, Bytes::new())
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(3 + self.payload.len() + TAG_SIZE);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.channel);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    fn decode(data: Vec<u8>) -> Result<Self> {
        if data.len() < 3 {
            return Err(Error::protocol("link frame too short"));
        }
        let kind = FrameType::try_from(data[0])?;
        let channel = u16::from_be_bytes([data[1], data[2]]);
        let mut payload = Bytes::from(data);
        let payload = payload.split_off(3);
        Ok(Self {
            kind,
            channel,
            payload,
        })
    }
}

/// A frame queued for the writer, with the channel to credit once written
pub(crate) struct Outbound {
    pub frame: Frame,
    pub sent_from: Option<Arc<ChannelInner>>,
}

impl Outbound {
    pub fn control(frame: Frame) -> Self {
        Self {
            frame,
            sent_from: None,
        }
    }
}

/// Per-direction record keys
#[derive(Clone)]
pub(crate) struct LinkKeys {
    send: [u8; 32],
    recv: [u8; 32],
}

/// Derive the link keys from our secret, the remote public key and both
/// session ids
pub(crate) fn derive_keys(
    role: Role,
    secret: &StaticSecret,
    remote_public: &[u8; 32],
    offer_session: u64,
    answer_session: u64,
) -> Result<LinkKeys> {
    let shared = secret.diffie_hellman(&PublicKey::from(*remote_public));
    if !shared.was_contributory() {
        return Err(Error::Crypto("remote public key is degenerate".into()));
    }

    let mut material = Vec::with_capacity(48);
    material.extend_from_slice(shared.as_bytes());
    material.extend_from_slice(&offer_session.to_be_bytes());
    material.extend_from_slice(&answer_session.to_be_bytes());

    let controlling = blake3::derive_key(CONTEXT_CONTROLLING, &material);
    let controlled = blake3::derive_key(CONTEXT_CONTROLLED, &material);

    Ok(match role {
        Role::Controlling => LinkKeys {
            send: controlling,
            recv: controlled,
        },
        Role::Controlled => LinkKeys {
            send: controlled,
            recv: controlling,
        },
    })
}

/// AES-256-GCM with a per-direction counter nonce
struct RecordCipher {
    cipher: Aes256Gcm,
    counter: u64,
}

impl RecordCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12]> {
        let counter = self.counter;
        self.counter = counter
            .checked_add(1)
            .ok_or_else(|| Error::Crypto("record counter exhausted".into()))?;
        let mut nonce = [0u8; 12];
        nonce[4..12].copy_from_slice(&counter.to_le_bytes());
        Ok(nonce)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Crypto("encryption failed".into()))
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Crypto("record shorter than tag".into()));
        }
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| Error::Crypto("record failed authentication".into()))
    }
}

/// Reading half of a link
pub(crate) struct RecordReader {
    half: OwnedReadHalf,
    cipher: RecordCipher,
    obfuscator: Option<Arc<dyn Obfuscator>>,
}

impl RecordReader {
    /// Next frame, or `None` once the remote closed the stream cleanly
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let len = match self.half.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_RECORD_SIZE {
            return Err(Error::protocol(format!("record of {} bytes exceeds limit", len)));
        }

        let mut record = vec![0u8; len];
        self.half.read_exact(&mut record).await?;
        if let Some(obfuscator) = &self.obfuscator {
            obfuscator.deobfuscate(&mut record)?;
        }

        let plaintext = self.cipher.open(&record)?;
        Frame::decode(plaintext).map(Some)
    }
}

/// Writing half of a link
pub(crate) struct RecordWriter {
    half: OwnedWriteHalf,
    cipher: RecordCipher,
    obfuscator: Option<Arc<dyn Obfuscator>>,
}

impl RecordWriter {
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut record = self.cipher.seal(&frame.encode())?;
        if let Some(obfuscator) = &self.obfuscator {
            obfuscator.obfuscate(&mut record);
        }

        let mut wire = Vec::with_capacity(4 + record.len());
        wire.extend_from_slice(&(record.len() as u32).to_be_bytes());
        wire.extend_from_slice(&record);
        self.half.write_all(&wire).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.half.shutdown().await;
    }
}

/// An authenticated link
pub(crate) struct Link {
    pub reader: RecordReader,
    pub writer: RecordWriter,
    pub route: ConnectionAddresses,
}

impl Link {
    fn new(
        stream: TcpStream,
        keys: &LinkKeys,
        obfuscator: Option<Arc<dyn Obfuscator>>,
    ) -> Result<Self> {
        let _ = stream.set_nodelay(true);
        let route = ConnectionAddresses {
            local: Endpoint::from(stream.local_addr()?),
            remote: Endpoint::from(stream.peer_addr()?),
        };
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: RecordReader {
                half: read_half,
                cipher: RecordCipher::new(&keys.recv),
                obfuscator: obfuscator.clone(),
            },
            writer: RecordWriter {
                half: write_half,
                cipher: RecordCipher::new(&keys.send),
                obfuscator,
            },
            route,
        })
    }
}

fn hello_payload(ufrag: &str) -> Vec<u8> {
    let mut payload = HELLO_MAGIC.to_vec();
    payload.extend_from_slice(ufrag.as_bytes());
    payload
}

/// Controlling side: send `Hello` for the remote `ufrag` and wait for the
/// remote to pick this link with `HelloAck`
pub(crate) async fn initiate(
    stream: TcpStream,
    keys: &LinkKeys,
    obfuscator: Option<Arc<dyn Obfuscator>>,
    remote_ufrag: &str,
) -> Result<Link> {
    let mut link = Link::new(stream, keys, obfuscator)?;
    link.writer
        .write_frame(&Frame::new(FrameType::Hello, 0, hello_payload(remote_ufrag)))
        .await?;

    match link.reader.read_frame().await? {
        Some(frame) if frame.kind == FrameType::HelloAck => Ok(link),
        Some(frame) => Err(Error::protocol(format!(
            "expected HelloAck, got {:?}",
            frame.kind
        ))),
        None => Err(Error::negotiation("link closed before HelloAck")),
    }
}

/// Controlled side: verify the `Hello` on an accepted stream
///
/// The `HelloAck` is only sent once this link has been selected.
pub(crate) async fn accept(
    stream: TcpStream,
    keys: &LinkKeys,
    obfuscator: Option<Arc<dyn Obfuscator>>,
    local_ufrag: &str,
) -> Result<Link> {
    let mut link = Link::new(stream, keys, obfuscator)?;
    match link.reader.read_frame().await? {
        Some(frame)
            if frame.kind == FrameType::Hello && frame.payload[..] == hello_payload(local_ufrag)[..] =>
        {
            Ok(link)
        }
        Some(_) => Err(Error::negotiation("unexpected hello on link")),
        None => Err(Error::negotiation("link closed before Hello")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn key_pair() -> (LinkKeys, LinkKeys) {
        let offer_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let answer_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let offer_public = PublicKey::from(&offer_secret).to_bytes();
        let answer_public = PublicKey::from(&answer_secret).to_bytes();

        let controlling =
            derive_keys(Role::Controlling, &offer_secret, &answer_public, 11, 22).unwrap();
        let controlled =
            derive_keys(Role::Controlled, &answer_secret, &offer_public, 11, 22).unwrap();
        (controlling, controlled)
    }

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_keys_mirror_each_other() {
        let (controlling, controlled) = key_pair();
        assert_eq!(controlling.send, controlled.recv);
        assert_eq!(controlling.recv, controlled.send);
        assert_ne!(controlling.send, controlling.recv);
    }

    #[test]
    fn test_frame_decode_rejects_unknown_type() {
        assert!(Frame::decode(vec![42, 0, 1]).is_err());
        assert!(Frame::decode(vec![4, 0]).is_err());
        let frame = Frame::decode(vec![4, 0, 7, b'h', b'i']).unwrap();
        assert_eq!(frame, Frame::new(FrameType::Binary, 7, &b"hi"[..]));
    }

    #[tokio::test]
    async fn test_handshake_and_frames_with_obfuscation() {
        let (controlling_keys, controlled_keys) = key_pair();
        let (dialed, accepted) = stream_pair().await;
        let caesar: Arc<dyn Obfuscator> = Arc::new(crate::peer::obfuscation::Caesar::new(13));

        let remote = {
            let caesar = Arc::clone(&caesar);
            tokio::spawn(async move {
                let mut link = accept(accepted, &controlled_keys, Some(caesar), "abcd")
                    .await
                    .unwrap();
                link.writer
                    .write_frame(&Frame::control(FrameType::HelloAck, 0))
                    .await
                    .unwrap();
                link.reader.read_frame().await.unwrap().unwrap()
            })
        };

        let mut link = initiate(dialed, &controlling_keys, Some(caesar), "abcd")
            .await
            .unwrap();
        let frame = Frame::new(FrameType::Text, 2, "{\"hello\":1}");
        link.writer.write_frame(&frame).await.unwrap();

        assert_eq!(remote.await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_mismatched_keys_fail_handshake() {
        let (controlling_keys, _) = key_pair();
        let (_, other_controlled) = key_pair();
        let (dialed, accepted) = stream_pair().await;

        let remote =
            tokio::spawn(async move { accept(accepted, &other_controlled, None, "abcd").await });
        tokio::spawn(async move {
            let _ = initiate(dialed, &controlling_keys, None, "abcd").await;
        });

        assert!(matches!(remote.await.unwrap(), Err(Error::Crypto(_))));
    }
}
