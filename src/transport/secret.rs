//! Authenticated, encrypted byte stream.
//!
//! [`SecretConnection::make`] runs the station-to-station handshake over any
//! [`RawStream`]:
//!
//! 1. exchange ephemeral X25519 keys (length-delimited `BytesValue`)
//! 2. derive directional keys and the challenge
//! 3. exchange `AuthSigMessage`s over the now-encrypted channel and verify
//!    the remote signature over the challenge
//!
//! Afterwards all traffic is carried in fixed-size sealed frames. The
//! connection splits into a [`SecretReader`] and a [`SecretWriter`] that
//! each own one direction's key and nonce.

use std::cmp::min;
use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use ed25519_dalek::VerifyingKey;
use prost::Message;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tracing::debug;

use super::proto::{
    AuthSigMessage, BytesValue, MAX_VARINT_LEN, PublicKey, check_delimited_len, encode_delimited,
    public_key,
};
use crate::core::{
    ConnectionError, CryptoError, DATA_LEN_SIZE, DATA_MAX_SIZE, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE, MAX_HANDSHAKE_MSG_SIZE, MConnConfig,
    PUBLIC_KEY_SIZE, PacketError, SEALED_FRAME_SIZE,
};
use crate::crypto::{
    FrameCipher, IdentityKeypair, KeyAgreement, SealedFrame, SessionKey, frame_chunk_len,
    parse_identity_key, verify_signature,
};

/// A duplex byte stream a secret connection can run over.
pub trait RawStream: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + 'static {}

/// Reading half of a secret connection over `S`.
pub type SecretReadHalf<S> = SecretReader<ReadHalf<S>>;

/// Writing half of a secret connection over `S`.
pub type SecretWriteHalf<S> = SecretWriter<WriteHalf<S>>;

/// Decrypting reader.
///
/// A frame's chunk that does not fit the caller's buffer is kept and served
/// by the following reads.
pub struct SecretReader<R> {
    inner: BufReader<R>,
    cipher: FrameCipher,
    sealed: Box<SealedFrame>,
    pending: BytesMut,
}

impl<R: AsyncRead + Unpin> SecretReader<R> {
    /// Wrap `inner` with a 65 KiB read buffer.
    pub fn new(inner: R, key: &SessionKey) -> Self {
        Self::from_buffered(BufReader::with_capacity(DEFAULT_READ_BUFFER_SIZE, inner), key)
    }

    /// Wrap an already buffered reader, keeping any bytes it holds.
    pub fn from_buffered(inner: BufReader<R>, key: &SessionKey) -> Self {
        Self {
            inner,
            cipher: FrameCipher::new(key),
            sealed: Box::new([0u8; SEALED_FRAME_SIZE]),
            pending: BytesMut::new(),
        }
    }

    /// Read and open the next frame, returning its chunk length.
    async fn next_chunk(&mut self) -> Result<usize, ConnectionError> {
        self.inner.read_exact(&mut self.sealed[..]).await?;
        self.cipher.open_frame(&mut self.sealed)?;

        let len = frame_chunk_len(&self.sealed[..]);
        if len > DATA_MAX_SIZE {
            return Err(ConnectionError::ChunkTooBig(len));
        }
        Ok(len)
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns at most one frame's chunk per call.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            let n = min(buf.len(), self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Ok(n);
        }

        let len = self.next_chunk().await?;
        let chunk = &self.sealed[DATA_LEN_SIZE..DATA_LEN_SIZE + len];
        let n = min(buf.len(), len);
        buf[..n].copy_from_slice(&chunk[..n]);
        self.pending.extend_from_slice(&chunk[n..]);
        Ok(n)
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read(&mut buf[filled..]).await?;
        }
        Ok(())
    }

    /// Append the next available plaintext to `dst`.
    pub async fn read_buf(&mut self, dst: &mut BytesMut) -> Result<usize, ConnectionError> {
        if !self.pending.is_empty() {
            let n = self.pending.len();
            dst.extend_from_slice(&self.pending);
            self.pending.clear();
            return Ok(n);
        }

        let len = self.next_chunk().await?;
        dst.extend_from_slice(&self.sealed[DATA_LEN_SIZE..DATA_LEN_SIZE + len]);
        Ok(len)
    }

    /// Read one varint length-prefixed message of at most `max` bytes.
    pub async fn read_delimited(&mut self, max: usize) -> Result<Bytes, ConnectionError> {
        let mut prefix = Vec::with_capacity(MAX_VARINT_LEN);
        while !prefix_complete(&prefix) {
            let mut byte = [0u8; 1];
            self.read_exact(&mut byte).await?;
            prefix.push(byte[0]);
        }
        let len = decode_prefix(&prefix)?;
        check_delimited_len(len, max)?;

        let mut msg = vec![0u8; len];
        self.read_exact(&mut msg).await?;
        Ok(Bytes::from(msg))
    }

    /// Frames opened so far.
    pub fn frames_read(&self) -> u64 {
        self.cipher.counter()
    }

    /// Consume the reader, returning the underlying stream.
    ///
    /// Buffered ciphertext is discarded.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

/// Encrypting writer.
pub struct SecretWriter<W> {
    inner: BufWriter<W>,
    cipher: FrameCipher,
    sealed: Box<SealedFrame>,
}

impl<W: AsyncWrite + Unpin> SecretWriter<W> {
    /// Wrap `inner` with a 128 KiB write buffer.
    pub fn new(inner: W, key: &SessionKey) -> Self {
        Self {
            inner: BufWriter::with_capacity(DEFAULT_WRITE_BUFFER_SIZE, inner),
            cipher: FrameCipher::new(key),
            sealed: Box::new([0u8; SEALED_FRAME_SIZE]),
        }
    }

    /// Seal `data` into as many frames as needed and flush them.
    ///
    /// Writes of at most [`DATA_MAX_SIZE`] bytes occupy a single frame.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        for chunk in data.chunks(DATA_MAX_SIZE) {
            self.cipher.seal_chunk(chunk, &mut self.sealed)?;
            self.inner.write_all(&self.sealed[..]).await?;
        }
        self.inner.flush().await?;
        Ok(data.len())
    }

    /// Write `msg` with a varint length prefix.
    pub async fn write_delimited<M: Message>(&mut self, msg: &M) -> Result<(), ConnectionError> {
        self.write(&encode_delimited(msg)).await?;
        Ok(())
    }

    /// Frames sealed so far.
    pub fn frames_written(&self) -> u64 {
        self.cipher.counter()
    }

    /// Flush and shut down the underlying stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    /// Consume the writer, returning the underlying stream.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

/// Whether `prefix` holds a whole varint, or as many bytes as one may take.
fn prefix_complete(prefix: &[u8]) -> bool {
    prefix.len() >= MAX_VARINT_LEN || prefix.last().is_some_and(|b| b & 0x80 == 0)
}

fn decode_prefix(prefix: &[u8]) -> Result<usize, PacketError> {
    Ok(prost::decode_length_delimiter(prefix)?)
}

/// Read one varint length-prefixed message from a plaintext stream.
///
/// Reads byte by byte so nothing past the message is consumed.
async fn read_delimited_raw<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> Result<Bytes, ConnectionError> {
    let mut prefix = Vec::with_capacity(MAX_VARINT_LEN);
    while !prefix_complete(&prefix) {
        prefix.push(reader.read_u8().await?);
    }
    let len = decode_prefix(&prefix)?;
    check_delimited_len(len, max)?;

    let mut msg = vec![0u8; len];
    reader.read_exact(&mut msg).await?;
    Ok(Bytes::from(msg))
}

/// Send our ephemeral key and receive the remote one concurrently.
async fn share_eph_pub_key<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: &[u8; PUBLIC_KEY_SIZE],
) -> Result<[u8; PUBLIC_KEY_SIZE], ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = encode_delimited(&BytesValue {
        value: Bytes::copy_from_slice(local),
    });

    let send = async {
        writer.write_all(&msg).await?;
        writer.flush().await?;
        Ok::<_, ConnectionError>(())
    };
    let recv = async {
        let raw = read_delimited_raw(reader, MAX_HANDSHAKE_MSG_SIZE).await?;
        let msg = BytesValue::decode(raw).map_err(PacketError::from)?;
        Ok::<_, ConnectionError>(msg.value)
    };
    let ((), remote) = tokio::try_join!(send, recv)?;

    <[u8; PUBLIC_KEY_SIZE]>::try_from(&remote[..]).map_err(|_| {
        CryptoError::InvalidPublicKey(format!(
            "ephemeral key must be {PUBLIC_KEY_SIZE} bytes, got {}",
            remote.len()
        ))
        .into()
    })
}

/// Send our identity and signature and receive the remote ones concurrently.
async fn share_auth_signature<R, W>(
    reader: &mut SecretReader<R>,
    writer: &mut SecretWriter<W>,
    msg: &AuthSigMessage,
) -> Result<AuthSigMessage, ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let send = writer.write_delimited(msg);
    let recv = async {
        let raw = reader.read_delimited(MAX_HANDSHAKE_MSG_SIZE).await?;
        Ok::<_, ConnectionError>(AuthSigMessage::decode(raw).map_err(PacketError::from)?)
    };
    let ((), remote) = tokio::try_join!(send, recv)?;
    Ok(remote)
}

/// An authenticated, encrypted connection.
pub struct SecretConnection<S> {
    reader: SecretReadHalf<S>,
    writer: SecretWriteHalf<S>,
    remote_pub_key: VerifyingKey,
}

impl<S: RawStream> SecretConnection<S> {
    /// Run the handshake over `stream`, bounded by the default timeout.
    pub async fn make(stream: S, local: &IdentityKeypair) -> Result<Self, ConnectionError> {
        Self::make_with_timeout(stream, local, DEFAULT_HANDSHAKE_TIMEOUT).await
    }

    /// Run the handshake over `stream`, bounded by the configured
    /// `handshake_timeout`.
    pub async fn make_with_config(
        stream: S,
        local: &IdentityKeypair,
        config: &MConnConfig,
    ) -> Result<Self, ConnectionError> {
        Self::make_with_timeout(stream, local, config.handshake_timeout).await
    }

    /// Run the handshake over `stream`, failing after `timeout`.
    pub async fn make_with_timeout(
        stream: S,
        local: &IdentityKeypair,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        tokio::time::timeout(timeout, Self::handshake(stream, local))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)?
    }

    async fn handshake(stream: S, local: &IdentityKeypair) -> Result<Self, ConnectionError> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut buffered = BufReader::with_capacity(DEFAULT_READ_BUFFER_SIZE, read_half);

        let agreement = KeyAgreement::generate();
        let remote_eph =
            share_eph_pub_key(&mut buffered, &mut write_half, agreement.public_key()).await?;
        let secrets = agreement.complete(&remote_eph)?;

        let mut reader = SecretReader::from_buffered(buffered, &secrets.recv_key);
        let mut writer = SecretWriter::new(write_half, &secrets.send_key);

        let local_auth = AuthSigMessage {
            pub_key: Some(PublicKey::ed25519(Bytes::copy_from_slice(
                local.public_key().as_bytes(),
            ))),
            sig: Bytes::copy_from_slice(&local.sign(&secrets.challenge).to_bytes()),
        };
        let remote_auth = share_auth_signature(&mut reader, &mut writer, &local_auth).await?;

        let remote_key = remote_auth
            .pub_key
            .ok_or(PacketError::MissingField("pub_key"))?;
        let remote_pub_key = match &remote_key.sum {
            Some(public_key::Sum::Ed25519(key)) => parse_identity_key(key)?,
            _ => {
                return Err(
                    CryptoError::UnexpectedPubKeyType(remote_key.type_name().into()).into(),
                );
            }
        };
        verify_signature(&remote_pub_key, &secrets.challenge, &remote_auth.sig)?;

        debug!(
            remote_pub_key = ?remote_pub_key.as_bytes(),
            "secret connection established"
        );
        Ok(Self {
            reader,
            writer,
            remote_pub_key,
        })
    }

    /// The authenticated identity of the remote side.
    pub fn remote_pub_key(&self) -> &VerifyingKey {
        &self.remote_pub_key
    }

    /// Read up to `buf.len()` bytes.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        self.reader.read(buf).await
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        self.reader.read_exact(buf).await
    }

    /// Write and flush `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.writer.write(data).await
    }

    /// Shut down the underlying stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (SecretReadHalf<S>, SecretWriteHalf<S>) {
        (self.reader, self.writer)
    }
}

impl<S> std::fmt::Debug for SecretConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretConnection")
            .field("remote_pub_key", &self.remote_pub_key)
            .finish_non_exhaustive()
    }
}
