/*!
String pool embedded in published snapshots.

All strings of a snapshot are stored concatenated in one buffer; map
entries hold offset/length references into it. The pool is dropped once
together with its snapshot.
*/

/// Reference into a [`StrPool`].
///
/// The default reference points at the empty string at the start of the
/// pool, matching the convention that "no text" and "empty text" read
/// identically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrRef {
    off: u32,
    len: u32,
}

impl StrRef {
    pub const EMPTY: StrRef = StrRef { off: 0, len: 0 };

    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    pub fn len(self) -> usize {
        self.len as usize
    }
}

/// Builds the concatenated string buffer of a snapshot.
#[derive(Default)]
pub struct StrMapBuilder {
    buf: String,
}

impl StrMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a string and returns its reference.
    pub fn push(&mut self, s: &str) -> StrRef {
        if s.is_empty() {
            return StrRef::EMPTY;
        }
        let off = self.buf.len() as u32;
        self.buf.push_str(s);
        StrRef {
            off,
            len: s.len() as u32,
        }
    }

    /// Appends UTF-16 data, converting lossily and stopping at the
    /// first NUL terminator.
    pub fn push_utf16(&mut self, units: &[u16]) -> StrRef {
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        let s = widestring::U16Str::from_slice(&units[..end]).to_string_lossy();
        self.push(&s)
    }

    /// Reads back a string pushed earlier. The buffer is append-only,
    /// so references returned by `push` resolve before `finish` too.
    pub fn peek(&self, r: StrRef) -> &str {
        let start = r.off as usize;
        let end = start + r.len as usize;
        self.buf.get(start..end).unwrap_or("")
    }

    /// Finalizes the pool. All previously returned references stay valid.
    pub fn finish(self) -> StrPool {
        StrPool {
            buf: self.buf.into_boxed_str(),
        }
    }
}

/// Immutable concatenated string storage owned by a snapshot.
#[derive(Debug, Default)]
pub struct StrPool {
    buf: Box<str>,
}

impl StrPool {
    pub fn get(&self, r: StrRef) -> &str {
        let start = r.off as usize;
        let end = start + r.len as usize;
        self.buf.get(start..end).unwrap_or("")
    }

    /// Total size of the pooled text in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_get() {
        let mut b = StrMapBuilder::new();
        let r1 = b.push("ntdll.dll");
        let r2 = b.push("kernel32.dll");
        let r3 = b.push("");
        let pool = b.finish();

        assert_eq!(pool.get(r1), "ntdll.dll");
        assert_eq!(pool.get(r2), "kernel32.dll");
        assert_eq!(pool.get(r3), "");
        assert_eq!(pool.get(StrRef::EMPTY), "");
    }

    #[test]
    fn test_push_utf16() {
        let mut b = StrMapBuilder::new();
        let units = "smss.exe\0garbage"
            .encode_utf16()
            .collect::<Vec<_>>();
        let r = b.push_utf16(&units);
        let pool = b.finish();
        assert_eq!(pool.get(r), "smss.exe");
    }
}
