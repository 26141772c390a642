//! Checked binary decoding helpers.
//!
//! Every multi-byte integer on the wire and on disk is big-endian (network
//! byte order). Decoders never trust a length field: the remaining buffer is
//! checked before anything is read or allocated, and a short or oversized
//! input becomes a [`DecodeError`] instead of a panic.

use bytes::Buf;

/// Why a packed structure could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes left than the field needs.
    #[error("truncated {what}: need {needed} bytes, {available} left")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    /// A count or size field declares more than the configured maximum.
    #[error("{what} declares {declared}, limit is {limit}")]
    TooLarge {
        what: &'static str,
        declared: usize,
        limit: usize,
    },

    /// The format version byte is not one we can read.
    #[error("unsupported format version {0}")]
    Version(u8),

    /// Structurally invalid content (bad family, bad level, trailing bytes).
    #[error("malformed {0}")]
    Malformed(String),
}

/// Checked reads over any [`Buf`].
pub(crate) trait BufExt: Buf {
    fn ensure(&self, needed: usize, what: &'static str) -> Result<(), DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::Truncated {
                what,
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    fn try_u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        self.ensure(1, what)?;
        Ok(self.get_u8())
    }

    fn try_u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        self.ensure(2, what)?;
        Ok(self.get_u16())
    }

    fn try_u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        self.ensure(4, what)?;
        Ok(self.get_u32())
    }

    fn try_bytes(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>, DecodeError> {
        self.ensure(len, what)?;
        let mut out = vec![0u8; len];
        self.copy_to_slice(&mut out);
        Ok(out)
    }
}

impl<T: Buf + ?Sized> BufExt for T {}

/// Rejects `declared` when it is above `limit`.
pub(crate) fn check_limit(
    what: &'static str,
    declared: usize,
    limit: usize,
) -> Result<(), DecodeError> {
    if declared > limit {
        return Err(DecodeError::TooLarge {
            what,
            declared,
            limit,
        });
    }
    Ok(())
}

/// Fails when a decoder left unread bytes behind.
pub(crate) fn expect_end(buf: &impl Buf, what: &str) -> Result<(), DecodeError> {
    if buf.has_remaining() {
        return Err(DecodeError::Malformed(format!(
            "{what}: {} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(())
}
