use tokio::io::{AsyncRead, AsyncWrite};

use tether_core::{
    codec_from_slice, codec_to_vec, frame, BufferPool, CodecError, FrameError, Packet,
    PacketError, SystemPacket,
};
use tether_crypto::{
    transcript, AeadSealer, ClientHandshake, CryptoError, EphemeralKeyPair, HandshakeError,
    KexError, ServerHandshake, ServerIdentity, CHALLENGE_LEN,
};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeFailure {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Kex(#[from] KexError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Drive the server half of the four-message handshake and return the bound
/// session sealer.
///
/// The server presents its identity key, receives the client's challenge and
/// ephemeral key, answers with its own ephemeral key plus a signature over
/// the whole transcript, then derives the session key. No step partially
/// succeeds: any failure aborts the connection before it is ever registered.
pub(crate) async fn drive<R, W>(
    reader: &mut R,
    writer: &mut W,
    identity: &ServerIdentity,
    pool: &BufferPool,
    max_len: usize,
) -> Result<AeadSealer, HandshakeFailure>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = Packet::system(SystemPacket::Handshake, identity.public_key_der().to_vec());
    frame::write_frame(writer, &hello.encode(max_len)?, max_len).await?;

    let packet = read_handshake_packet(reader, pool, max_len).await?;
    let client: ClientHandshake = codec_from_slice(packet.payload())?;
    if client.challenge.len() != CHALLENGE_LEN {
        return Err(HandshakeError::BadChallenge(client.challenge.len()).into());
    }
    if client.client_ephemeral_key.is_empty() {
        return Err(HandshakeError::EmptyField("client_ephemeral_key").into());
    }

    let ephemeral = EphemeralKeyPair::generate()?;
    let message = transcript(
        &client.challenge,
        &client.client_ephemeral_key,
        ephemeral.public_key_der(),
    );
    let reply = ServerHandshake {
        server_ephemeral_key: ephemeral.public_key_der().to_vec(),
        signature: identity.sign(&message),
    };
    let packet = Packet::system(SystemPacket::Handshake, codec_to_vec(&reply)?);
    frame::write_frame(writer, &packet.encode(max_len)?, max_len).await?;

    let key = ephemeral.derive_shared_key(&client.client_ephemeral_key)?;
    Ok(AeadSealer::new(key)?)
}

/// Read frames until a handshake envelope arrives.
///
/// Keep-alive frames are legal in any state and are skipped; a `Disconnect`
/// aborts the handshake as an orderly close; anything else is a protocol
/// violation.
async fn read_handshake_packet<R>(
    reader: &mut R,
    pool: &BufferPool,
    max_len: usize,
) -> Result<Packet, HandshakeFailure>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(buf) = frame::read_frame(reader, pool, max_len).await? else {
            continue;
        };
        let packet = Packet::decode(&buf)?;
        match packet.system_kind() {
            Some(SystemPacket::Handshake) => return Ok(packet),
            Some(SystemPacket::Disconnect) => {
                return Err(HandshakeError::PeerDisconnected.into());
            }
            _ => return Err(HandshakeError::UnexpectedPacket(packet.id()).into()),
        }
    }
}
