// Immutable UTF-16 string buffers. Strings are the only heap payload shared
// across domains: the buffer is reference-counted with atomic counters and
// each domain wraps it in its own GC-managed header without copying.

use std::sync::Arc;

/// The shared immutable payload of a Skizo string.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SoStr {
    chars: Box<[u16]>,
}

impl SoStr {
    pub fn from_utf8(text: &str) -> Arc<SoStr> {
        Arc::new(SoStr {
            chars: text.encode_utf16().collect(),
        })
    }

    pub fn from_utf16(chars: &[u16]) -> Arc<SoStr> {
        Arc::new(SoStr {
            chars: chars.into(),
        })
    }

    pub fn chars(&self) -> &[u16] {
        &self.chars
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Lossy only for unpaired surrogates, which Skizo strings cannot
    /// contain by construction.
    pub fn to_utf8(&self) -> String {
        String::from_utf16_lossy(&self.chars)
    }

    pub fn eq_utf8(&self, text: &str) -> bool {
        self.chars.iter().copied().eq(text.encode_utf16())
    }
}

/// Raw-pointer plumbing for GC headers: the header field holds a
/// `Arc::into_raw` pointer whose count the header owns.

pub fn sostr_into_raw(s: Arc<SoStr>) -> *const SoStr {
    Arc::into_raw(s)
}

/// Clones the Arc behind a raw header field without consuming it.
///
/// # Safety
/// `ptr` must originate from `sostr_into_raw` and still be owned by a live
/// header.
pub unsafe fn sostr_clone_raw(ptr: *const SoStr) -> Arc<SoStr> {
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

/// Releases the count owned by a dying header.
///
/// # Safety
/// `ptr` must originate from `sostr_into_raw`; the header must not be read
/// again.
pub unsafe fn sostr_drop_raw(ptr: *const SoStr) {
    drop(Arc::from_raw(ptr));
}

/// A slice view into a shared string, safe to move across domains because
/// it pins the backing buffer.
#[derive(Debug, Clone)]
pub struct StrSlice {
    buf: Arc<SoStr>,
    start: usize,
    end: usize,
}

impl StrSlice {
    pub fn whole(buf: Arc<SoStr>) -> Self {
        let end = buf.len();
        Self { buf, start: 0, end }
    }

    pub fn from_utf8(text: &str) -> Self {
        Self::whole(SoStr::from_utf8(text))
    }

    pub fn chars(&self) -> &[u16] {
        &self.buf.chars()[self.start..self.end]
    }

    pub fn to_utf8(&self) -> String {
        String::from_utf16_lossy(self.chars())
    }

    pub fn eq_utf8(&self, text: &str) -> bool {
        self.chars().iter().copied().eq(text.encode_utf16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_round_trip_is_identity() {
        let s = SoStr::from_utf8("Division by zero.");
        assert_eq!(s.len(), "Division by zero.".len());
        assert_eq!(s.to_utf8(), "Division by zero.");
        // Low halves carry the bytes for all-ASCII input.
        for (c, b) in s.chars().iter().zip("Division by zero.".bytes()) {
            assert_eq!(*c, b as u16);
        }
    }

    #[test]
    fn test_raw_refcount_round_trip() {
        let s = SoStr::from_utf8("shared");
        let raw = sostr_into_raw(Arc::clone(&s));
        let cloned = unsafe { sostr_clone_raw(raw) };
        assert!(Arc::ptr_eq(&s, &cloned));
        unsafe { sostr_drop_raw(raw) };
        assert_eq!(Arc::strong_count(&s), 2);
    }

    #[test]
    fn test_slice_survives_independent_of_origin() {
        let slice = StrSlice::from_utf8("inc");
        assert!(slice.eq_utf8("inc"));
        assert_eq!(slice.to_utf8(), "inc");
    }
}
