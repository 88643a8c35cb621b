//! Buffer handles for raw image data.
//!
//! A [`Reference`] pairs a byte buffer with the metadata the translate
//! driver needs: an optional format descriptor string and signed
//! dimensions. Storage is either borrowed from the caller (sources) or
//! owned (destinations and pipeline intermediates); only owned storage can
//! grow, and [`Reference::resize`] is the sole growth point.

/// Backing storage for a [`Reference`].
pub enum Storage<'a> {
    /// Caller-owned bytes; read-only, never reallocated.
    Borrowed(&'a [u8]),
    /// Crate-owned bytes; grown on demand, freed on drop.
    Owned(Vec<u8>),
}

/// A described byte buffer holding one image in some on-disk or in-memory
/// representation.
pub struct Reference<'a> {
    storage: Storage<'a>,
    /// Format descriptor string, e.g. `"R8G8B8A8*PAD1.PNG"`. See the crate
    /// docs for the full grammar.
    pub format: Option<String>,
    /// Signed width: negative flips X.
    pub w: i32,
    /// Signed height: negative flips Y (bottom-up).
    pub h: i32,
}

impl<'a> Reference<'a> {
    /// Reference caller-owned bytes.
    pub fn from_slice(data: &'a [u8]) -> Self {
        Self {
            storage: Storage::Borrowed(data),
            format: None,
            w: 0,
            h: 0,
        }
    }

    /// Create an empty self-owned reference that can grow.
    pub fn new_owned() -> Reference<'static> {
        Reference {
            storage: Storage::Owned(Vec::new()),
            format: None,
            w: 0,
            h: 0,
        }
    }

    /// Set the format descriptor string.
    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_owned());
        self
    }

    /// Set the signed dimensions.
    pub fn with_size(mut self, w: i32, h: i32) -> Self {
        self.w = w;
        self.h = h;
        self
    }

    /// Number of bytes currently held.
    pub fn bytes(&self) -> usize {
        match &self.storage {
            Storage::Borrowed(data) => data.len(),
            Storage::Owned(data) => data.len(),
        }
    }

    /// Read access to the bytes.
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Borrowed(data) => data,
            Storage::Owned(data) => data,
        }
    }

    /// Write access to the bytes. Owned storage only.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Borrowed(_) => panic!("destination reference does not own its storage"),
            Storage::Owned(data) => data,
        }
    }

    /// Whether this reference can be written to and resized.
    pub fn is_owned(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    /// Resize owned storage to exactly `bytes`.
    ///
    /// New bytes are zeroed; when `fresh` is set the entire buffer is
    /// zeroed, matching a reallocation.
    pub(crate) fn resize(&mut self, bytes: usize, fresh: bool) {
        match &mut self.storage {
            Storage::Borrowed(_) => panic!("cannot resize a borrowed reference"),
            Storage::Owned(data) => {
                if fresh {
                    data.clear();
                }
                data.resize(bytes, 0);
            }
        }
    }
}

impl PartialEq for Reference<'_> {
    /// Dimensions, format string, byte length, and contents.
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w
            && self.h == other.h
            && self.format == other.format
            && self.data() == other.data()
    }
}

impl std::fmt::Debug for Reference<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("format", &self.format)
            .field("w", &self.w)
            .field("h", &self.h)
            .field("bytes", &self.bytes())
            .field("owned", &self.is_owned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_reference_grows_zeroed() {
        let mut r = Reference::new_owned();
        assert_eq!(r.bytes(), 0);
        r.resize(4, false);
        assert_eq!(r.data(), &[0, 0, 0, 0]);
        r.data_mut().copy_from_slice(&[1, 2, 3, 4]);
        r.resize(6, false);
        assert_eq!(r.data(), &[1, 2, 3, 4, 0, 0]);
        r.resize(6, true);
        assert_eq!(r.data(), &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn equality_compares_contents_and_dims() {
        let bytes = [1u8, 2, 3];
        let a = Reference::from_slice(&bytes).with_size(3, 1);
        let mut b = Reference::new_owned().with_size(3, 1);
        b.resize(3, false);
        b.data_mut().copy_from_slice(&bytes);
        assert_eq!(a, b);
        let c = Reference::from_slice(&bytes).with_size(1, 3);
        assert_ne!(a, c);
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn borrowed_reference_rejects_writes() {
        let bytes = [0u8; 2];
        let mut r = Reference::from_slice(&bytes);
        let _ = r.data_mut();
    }
}
