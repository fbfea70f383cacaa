//! Routing keys carried by inbound object requests.
//!
//! A routing key names the server that hosts the target object, the orb inside
//! that server, and the object itself. The encoding is:
//!
//! ```text
//! b"ORBK" | version: u8 | server_id: u32 BE | orb_len: u16 BE | orb_id | object_id...
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ServerId;

const MAGIC: &[u8; 4] = b"ORBK";
const VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4 + 2;

/// Decoded routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey {
	/// Server hosting the object.
	pub server_id: ServerId,
	/// Orb inside the server.
	pub orb_id: String,
	/// Opaque object identity, interpreted by the hosting server only.
	pub object_id: Vec<u8>,
}

/// Errors decoding a routing key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingKeyError {
	/// Fewer bytes than the fixed header or the declared orb id length.
	#[error("routing key truncated: {len} bytes")]
	Truncated {
		/// Length of the input.
		len: usize,
	},
	/// Input does not start with the routing key magic.
	#[error("routing key magic mismatch")]
	BadMagic,
	/// Unknown encoding version.
	#[error("unsupported routing key version {0}")]
	UnsupportedVersion(u8),
	/// Orb id bytes are not UTF-8.
	#[error("routing key orb id is not utf-8")]
	OrbIdNotUtf8,
	/// Orb id does not fit the length prefix.
	#[error("orb id too long: {0} bytes")]
	OrbIdTooLong(usize),
}

impl RoutingKey {
	/// Creates a routing key.
	pub fn new(server_id: ServerId, orb_id: impl Into<String>, object_id: impl Into<Vec<u8>>) -> Self {
		Self {
			server_id,
			orb_id: orb_id.into(),
			object_id: object_id.into(),
		}
	}

	/// Encodes the key.
	///
	/// # Errors
	///
	/// Returns [`RoutingKeyError::OrbIdTooLong`] if the orb id exceeds `u16::MAX` bytes.
	pub fn encode(&self) -> Result<Vec<u8>, RoutingKeyError> {
		let orb = self.orb_id.as_bytes();
		let orb_len = u16::try_from(orb.len()).map_err(|_| RoutingKeyError::OrbIdTooLong(orb.len()))?;
		let mut out = Vec::with_capacity(HEADER_LEN + orb.len() + self.object_id.len());
		out.extend_from_slice(MAGIC);
		out.push(VERSION);
		out.extend_from_slice(&self.server_id.0.to_be_bytes());
		out.extend_from_slice(&orb_len.to_be_bytes());
		out.extend_from_slice(orb);
		out.extend_from_slice(&self.object_id);
		Ok(out)
	}

	/// Decodes a key produced by [`Self::encode`].
	///
	/// # Errors
	///
	/// Returns a [`RoutingKeyError`] describing the first malformed field.
	pub fn decode(bytes: &[u8]) -> Result<Self, RoutingKeyError> {
		if bytes.len() < HEADER_LEN {
			return Err(RoutingKeyError::Truncated { len: bytes.len() });
		}
		if &bytes[..4] != MAGIC {
			return Err(RoutingKeyError::BadMagic);
		}
		if bytes[4] != VERSION {
			return Err(RoutingKeyError::UnsupportedVersion(bytes[4]));
		}
		let server_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
		let orb_len = usize::from(u16::from_be_bytes([bytes[9], bytes[10]]));
		let rest = &bytes[HEADER_LEN..];
		if rest.len() < orb_len {
			return Err(RoutingKeyError::Truncated { len: bytes.len() });
		}
		let (orb, object_id) = rest.split_at(orb_len);
		let orb_id = std::str::from_utf8(orb).map_err(|_| RoutingKeyError::OrbIdNotUtf8)?;
		Ok(Self {
			server_id: ServerId(server_id),
			orb_id: orb_id.to_string(),
			object_id: object_id.to_vec(),
		})
	}
}
