//! Bounds-checked byte view over a mapped image.
//!
//! Every directory and table reader in the loader goes through [`ImageView`]; the
//! `rva_to_slice` accessor is the single place where RVA range and overflow
//! validation lives. Malformed or adversarial images can therefore never cause an
//! out-of-bounds read, regardless of which table is being walked.
//!
//! Because the view covers *virtual-layout* bytes, an RVA is a direct offset into
//! the underlying slice.

use crate::Result;

/// Upper bound for NUL-terminated string reads.
///
/// Import/export names and forwarder strings are short; a missing terminator in a
/// corrupt image must not turn into an unbounded scan.
const MAX_CSTR_LEN: usize = 4096;

/// A borrowed, bounds-checked view of a mapped image's bytes.
///
/// All accessors return [`crate::Error::OutOfBounds`] instead of reading past the
/// mapping, and all offset arithmetic is overflow-checked.
///
/// # Examples
///
/// ```rust
/// use peload::pe::ImageView;
///
/// let data = [0x4Du8, 0x5A, 0x00, 0x00, 0x78, 0x56, 0x34, 0x12];
/// let view = ImageView::new(&data);
///
/// assert_eq!(view.read_u16(0)?, 0x5A4D);
/// assert_eq!(view.read_u32(4)?, 0x1234_5678);
/// assert!(view.read_u64(4).is_err());
/// # Ok::<(), peload::Error>(())
/// ```
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    data: &'a [u8],
}

impl<'a> ImageView<'a> {
    /// Creates a view over the given virtual-layout bytes.
    #[must_use]
    pub fn new(data: &'a [u8]) -> ImageView<'a> {
        ImageView { data }
    }

    /// Returns the size of the viewed region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the viewed region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if `[rva, rva + len)` lies fully within the view.
    #[must_use]
    pub fn contains(&self, rva: u32, len: usize) -> bool {
        match (rva as usize).checked_add(len) {
            Some(end) => end <= self.data.len(),
            None => false,
        }
    }

    /// Returns the `len` bytes starting at `rva`.
    ///
    /// This is the single bounds/overflow validation point for all image reads.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range overflows or extends past
    /// the mapping.
    pub fn rva_to_slice(&self, rva: u32, len: usize) -> Result<&'a [u8]> {
        let start = rva as usize;
        let end = start.checked_add(len).ok_or(crate::Error::OutOfBounds)?;

        self.data.get(start..end).ok_or(crate::Error::OutOfBounds)
    }

    /// Reads a `u8` at `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `rva` is outside the mapping.
    pub fn read_u8(&self, rva: u32) -> Result<u8> {
        Ok(self.rva_to_slice(rva, 1)?[0])
    }

    /// Reads a little-endian `u16` at `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the read extends past the mapping.
    pub fn read_u16(&self, rva: u32) -> Result<u16> {
        let bytes = self.rva_to_slice(rva, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a little-endian `u32` at `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the read extends past the mapping.
    pub fn read_u32(&self, rva: u32) -> Result<u32> {
        let bytes = self.rva_to_slice(rva, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a little-endian `u64` at `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the read extends past the mapping.
    pub fn read_u64(&self, rva: u32) -> Result<u64> {
        let bytes = self.rva_to_slice(rva, 8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Reads a NUL-terminated ASCII string at `rva`.
    ///
    /// The scan is capped at 4 KiB; PE name strings are short and an unterminated
    /// string in a corrupt image must stay bounded.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `rva` is outside the mapping, or an
    /// [`crate::Error::ImageFormat`] if no terminator is found within the cap or the
    /// bytes are not valid ASCII.
    pub fn read_cstr(&self, rva: u32) -> Result<&'a str> {
        let start = rva as usize;
        let tail = self.data.get(start..).ok_or(crate::Error::OutOfBounds)?;
        let window = &tail[..tail.len().min(MAX_CSTR_LEN)];

        let nul = window
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| image_error!("unterminated string at rva {:#x}", rva))?;

        let bytes = &window[..nul];
        if !bytes.is_ascii() {
            return Err(image_error!("non-ASCII name string at rva {:#x}", rva));
        }

        // ASCII was just verified, so the conversion cannot fail.
        std::str::from_utf8(bytes).map_err(|_| image_error!("invalid name string at rva {:#x}", rva))
    }
}
