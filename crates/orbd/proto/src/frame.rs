//! Length-prefixed postcard framing for [`Frame`]s.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::Frame;

/// Largest frame accepted on the control socket.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Errors reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
	/// Socket I/O failed.
	#[error("frame i/o: {0}")]
	Io(#[from] std::io::Error),
	/// The frame body could not be encoded or decoded.
	#[error("frame codec: {0}")]
	Codec(#[from] postcard::Error),
	/// The peer announced a frame larger than [`MAX_FRAME_LEN`].
	#[error("frame of {len} bytes exceeds limit of {max}")]
	TooLarge {
		/// Announced length.
		len: u32,
		/// Limit.
		max: u32,
	},
}

/// Writes one frame and flushes the writer.
///
/// # Errors
///
/// Returns [`FrameError`] if encoding or the write fails.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
	W: AsyncWrite + Unpin,
{
	let buf = postcard::to_allocvec(frame)?;
	let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
	if len > MAX_FRAME_LEN {
		return Err(FrameError::TooLarge { len, max: MAX_FRAME_LEN });
	}
	writer.write_u32_le(len).await?;
	writer.write_all(&buf).await?;
	writer.flush().await?;
	Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the stream
/// between frames.
///
/// # Errors
///
/// Returns [`FrameError`] on truncated frames, oversized frames, or decode failures.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
	R: AsyncRead + Unpin,
{
	let len = match reader.read_u32_le().await {
		Ok(len) => len,
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e.into()),
	};
	if len > MAX_FRAME_LEN {
		return Err(FrameError::TooLarge { len, max: MAX_FRAME_LEN });
	}
	let mut buf = vec![0u8; len as usize];
	reader.read_exact(&mut buf).await?;
	Ok(Some(postcard::from_bytes(&buf)?))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{Request, RequestId, RequestPayload, ServerId};

	#[tokio::test]
	async fn frames_survive_a_pipe() {
		let (mut a, mut b) = tokio::io::duplex(1024);
		let frame = Frame::Request(Request {
			id: RequestId(7),
			payload: RequestPayload::Locate {
				server_id: ServerId(300),
				endpoint_type: "clear".into(),
			},
		});
		write_frame(&mut a, &frame).await.unwrap();
		drop(a);

		let got = read_frame(&mut b).await.unwrap();
		match got {
			Some(Frame::Request(Request {
				id,
				payload: RequestPayload::Locate { server_id, endpoint_type },
			})) => {
				assert_eq!(id, RequestId(7));
				assert_eq!(server_id, ServerId(300));
				assert_eq!(endpoint_type, "clear");
			}
			other => panic!("unexpected frame: {other:?}"),
		}
		assert!(read_frame(&mut b).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn oversized_length_is_rejected() {
		let (mut a, mut b) = tokio::io::duplex(64);
		a.write_u32_le(MAX_FRAME_LEN + 1).await.unwrap();
		let err = read_frame(&mut b).await.unwrap_err();
		assert!(matches!(err, FrameError::TooLarge { .. }));
	}
}
