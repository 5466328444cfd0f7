//! Length-prefixed JSON frames on QUIC streams.

use quinn::{ReadExactError, RecvStream, SendStream, WriteError};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Integer type of the frame length prefix.
pub type LengthUint = u32;

/// Largest frame body accepted.
pub const MAX_FRAME_LEN: LengthUint = 16 * 1024 * 1024;

/// Errors reading or writing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The message could not be serialized.
    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),

    /// The body could not be decoded into the expected type.
    #[error("decode: {0}")]
    Decode(#[source] serde_json::Error),

    /// The frame is larger than [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),

    /// Writing to the stream failed.
    #[error("write: {0}")]
    Write(#[from] WriteError),

    /// Reading from the stream failed.
    #[error("read: {0}")]
    Read(#[from] ReadExactError),
}

/// Encodes `msg` as a length prefix and body.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<(Vec<u8>, Vec<u8>), FrameError> {
    let body = serde_json::to_vec(msg).map_err(FrameError::Encode)?;
    let len = LengthUint::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(FrameError::TooLarge(body.len()))?;
    Ok((len.to_le_bytes().to_vec(), body))
}

/// Writes one frame.
pub async fn write_frame<T: Serialize>(tx: &mut SendStream, msg: &T) -> Result<(), FrameError> {
    let (len_bytes, body) = encode_frame(msg)?;
    tx.write_all(&len_bytes).await?;
    tx.write_all(&body).await?;
    Ok(())
}

/// Reads one frame and decodes it as `T`.
pub async fn read_frame<T: DeserializeOwned>(rx: &mut RecvStream) -> Result<T, FrameError> {
    let len_to_read = {
        let mut buf = [0; size_of::<LengthUint>()];
        rx.read_exact(&mut buf).await?;
        LengthUint::from_le_bytes(buf)
    };
    if len_to_read > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len_to_read as usize));
    }

    let mut buf = vec![0; len_to_read as usize];
    rx.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(FrameError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_little_endian_length() {
        let (len, body) = encode_frame(&"hello").unwrap();
        assert_eq!(body, b"\"hello\"");
        assert_eq!(len, 7u32.to_le_bytes());
    }
}
