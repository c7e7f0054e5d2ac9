use tokio::io::{AsyncRead, AsyncReadExt};

use duel_shared::{frame_length, FRAME_HEADER_SIZE};

use crate::error::PeerError;

/// Reads one length-prefixed frame body.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames. A length
/// prefix over `max_frame_size` is an error and no body bytes are read.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Vec<u8>>, PeerError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(PeerError::io("reading frame header", err)),
    }

    let size = frame_length(header, max_frame_size)?;
    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| PeerError::io("reading frame body", err))?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use duel_shared::{encode_frame, Envelope, LocalIdentity, MessageType};

    #[tokio::test]
    async fn reads_consecutive_frames_then_eof() {
        let identity = LocalIdentity::generate();
        let first = Envelope::seal(&identity, MessageType::Chat, &"one").unwrap();
        let second = Envelope::seal(&identity, MessageType::Chat, &"two").unwrap();
        let mut bytes = encode_frame(&first, 1024).unwrap();
        bytes.extend(encode_frame(&second, 1024).unwrap());

        let mut reader = bytes.as_slice();
        let one = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        let two = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(Envelope::from_json(&one).unwrap(), first);
        assert_eq!(Envelope::from_json(&two).unwrap(), second);
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_prefix_is_refused() {
        let bytes = 4096u32.to_be_bytes();
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::Codec(duel_shared::CodecError::FrameTooLarge { size: 4096, .. })
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        let mut reader = bytes.as_slice();
        assert!(read_frame(&mut reader, 1024).await.is_err());
    }
}
