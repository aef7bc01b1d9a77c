use super::PeerMessage;
use crate::error::{ErrorCode, Result, SwarmError};
use crate::frame::{read_frame, write_frame};
use crate::piece::FileId;
use crate::tracker::PeerId;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub async fn send_message<W>(writer: &mut W, message: &PeerMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &message.to_frame()).await
}

/// `Ok(None)` when the peer closed the connection between messages
pub async fn recv_message<R>(reader: &mut R) -> Result<Option<PeerMessage>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) => Ok(Some(PeerMessage::from_frame(&frame)?)),
        None => Ok(None),
    }
}

/// Dialing side of the ping/pong exchange. Returns the remote peer id.
pub async fn initiate_handshake<S>(
    stream: &mut S,
    local_id: &PeerId,
    file_id: &FileId,
) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_message(
        stream,
        &PeerMessage::Handshake {
            peer_id: local_id.clone(),
            file_id: file_id.clone(),
        },
    )
    .await?;

    match recv_message(stream).await? {
        Some(PeerMessage::HandshakeAck { peer_id }) => {
            debug!("Handshake acknowledged by {}", peer_id);
            Ok(peer_id)
        }
        Some(PeerMessage::Error { code, message, .. }) => Err(code.into_error(message)),
        Some(other) => Err(SwarmError::ProtocolError(format!(
            "Expected handshake-ack, got {}",
            other.name()
        ))),
        None => Err(SwarmError::ProtocolError(
            "Connection closed during handshake".to_string(),
        )),
    }
}

/// Listening side: accept a handshake for `serving` only. Others get a
/// `NotFound` error before the call fails.
pub async fn accept_handshake<S>(
    stream: &mut S,
    local_id: &PeerId,
    serving: &FileId,
) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (peer_id, file_id) = match recv_message(stream).await? {
        Some(PeerMessage::Handshake { peer_id, file_id }) => (peer_id, file_id),
        Some(other) => {
            return Err(SwarmError::ProtocolError(format!(
                "Expected handshake, got {}",
                other.name()
            )))
        }
        None => {
            return Err(SwarmError::ProtocolError(
                "Connection closed before handshake".to_string(),
            ))
        }
    };

    if &file_id != serving {
        send_message(stream, &PeerMessage::error(ErrorCode::NotFound, "File not found")).await?;
        return Err(SwarmError::NotFound(format!("file {}", file_id)));
    }

    send_message(
        stream,
        &PeerMessage::HandshakeAck {
            peer_id: local_id.clone(),
        },
    )
    .await?;

    Ok(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_between_two_ends() {
        let (mut dialer, mut listener) = tokio::io::duplex(1024);
        let file = FileId::from("f");
        let serving = file.clone();

        let accept = tokio::spawn(async move {
            accept_handshake(&mut listener, &PeerId::from("server"), &serving).await
        });

        let remote = initiate_handshake(&mut dialer, &PeerId::from("client"), &file)
            .await
            .unwrap();
        assert_eq!(remote, PeerId::from("server"));
        assert_eq!(accept.await.unwrap().unwrap(), PeerId::from("client"));
    }

    #[tokio::test]
    async fn test_handshake_for_other_file_is_not_found() {
        let (mut dialer, mut listener) = tokio::io::duplex(1024);

        let accept = tokio::spawn(async move {
            accept_handshake(&mut listener, &PeerId::from("server"), &FileId::from("mine")).await
        });

        let err = initiate_handshake(&mut dialer, &PeerId::from("client"), &FileId::from("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::NotFound(_)));
        assert!(matches!(accept.await.unwrap(), Err(SwarmError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_recv_message_reports_clean_close() {
        let mut stream = tokio_test::io::Builder::new().build();
        assert!(recv_message(&mut stream).await.unwrap().is_none());
    }
}
