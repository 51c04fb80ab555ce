use tokio::io::{AsyncRead, AsyncWrite};

use tether_core::{codec_from_slice, codec_to_vec, frame, BufferPool, Packet, SystemPacket};
use tether_crypto::{
    new_challenge, transcript, verify_identity_signature, AeadSealer, ClientHandshake,
    EphemeralKeyPair, HandshakeError, ServerHandshake, TrustStore,
};

use crate::ClientError;

/// Drive the client half of the four-message handshake.
///
/// TOFU policy is applied to the server's identity key before anything else
/// leaves this side: a pinned-fingerprint mismatch aborts without sending
/// the challenge and without touching the trust store. The server's
/// signature is then checked over `challenge ‖ client_eph ‖ server_eph`
/// before the session key is derived.
pub(crate) async fn drive<R, W>(
    reader: &mut R,
    writer: &mut W,
    trust: &TrustStore,
    host: &str,
    port: u16,
    pool: &BufferPool,
    max_len: usize,
) -> Result<AeadSealer, ClientError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = read_handshake_packet(reader, pool, max_len).await?;
    let identity_der = hello.payload();
    if identity_der.is_empty() {
        return Err(HandshakeError::EmptyField("server_identity_key").into());
    }

    if !trust.verify_or_trust(host, port, identity_der)? {
        tracing::warn!(
            target: "tether::client",
            host,
            port,
            "server identity does not match the pinned fingerprint"
        );
        return Err(ClientError::IdentityMismatch {
            host: host.to_string(),
            port,
        });
    }

    let ephemeral = EphemeralKeyPair::generate()?;
    let challenge = new_challenge();
    let reply = ClientHandshake {
        challenge: challenge.to_vec(),
        client_ephemeral_key: ephemeral.public_key_der().to_vec(),
    };
    let packet = Packet::system(SystemPacket::Handshake, codec_to_vec(&reply)?);
    frame::write_frame(writer, &packet.encode(max_len)?, max_len).await?;

    let answer = read_handshake_packet(reader, pool, max_len).await?;
    let server: ServerHandshake = codec_from_slice(answer.payload())?;
    if server.server_ephemeral_key.is_empty() {
        return Err(HandshakeError::EmptyField("server_ephemeral_key").into());
    }

    let message = transcript(
        &challenge,
        ephemeral.public_key_der(),
        &server.server_ephemeral_key,
    );
    verify_identity_signature(identity_der, &message, &server.signature)?;

    let key = ephemeral.derive_shared_key(&server.server_ephemeral_key)?;
    Ok(AeadSealer::new(key)?)
}

/// Read frames until a handshake envelope arrives; keep-alives are skipped,
/// a `Disconnect` is an orderly abort, anything else is a protocol error.
async fn read_handshake_packet<R>(
    reader: &mut R,
    pool: &BufferPool,
    max_len: usize,
) -> Result<Packet, ClientError>
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
