//! Growable byte buffer with head/tail cursors.
//!
//! The readable region is `[begin, end)`, the writable region is
//! `[end, capacity)`. Reserving space either shifts the readable bytes
//! back to the front (when they are small relative to capacity) or grows
//! the storage, whichever yields more room for the same work.

/// Default growth hint applied when the buffer first expands.
const DEFAULT_GROW_HINT: usize = 512;

/// Contiguous byte buffer with separate read and write cursors.
///
/// Invariant: `0 <= begin <= end <= storage.len()`.
pub struct Buffer {
    storage: Vec<u8>,
    begin: usize,
    end: usize,
    grow_hint: usize,
}

impl Buffer {
    /// Create an empty buffer. No storage is allocated until the first
    /// append or reservation.
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
            begin: 0,
            end: 0,
            grow_hint: DEFAULT_GROW_HINT,
        }
    }

    /// Create an empty buffer with `cap` bytes of storage pre-allocated.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            storage: vec![0; cap],
            begin: 0,
            end: 0,
            grow_hint: DEFAULT_GROW_HINT,
        }
    }

    /// Number of readable bytes.
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    /// True when there are no readable bytes.
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Bytes writable at the tail without reserving.
    pub fn space(&self) -> usize {
        self.storage.len() - self.end
    }

    /// Total storage currently held.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// View of the readable region. Invalidated by any mutating call.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.begin..self.end]
    }

    /// Set the preferred growth step used when the storage expands.
    pub fn set_grow_hint(&mut self, hint: usize) {
        self.grow_hint = hint.max(1);
    }

    /// Ensure at least `n` writable bytes at the tail and return the
    /// writable slice. Compacts the readable bytes to the front when
    /// `size + n` fits comfortably in half the capacity, otherwise grows
    /// the storage.
    pub fn make_room(&mut self, n: usize) -> &mut [u8] {
        if self.space() < n {
            if self.size() + n < self.storage.len() / 2 {
                self.move_head();
            } else {
                let want = self
                    .grow_hint
                    .max(self.storage.len() * 2)
                    .max(self.size() + n);
                self.expand(want);
            }
        }
        &mut self.storage[self.end..]
    }

    /// Record that `n` bytes were written into the slice returned by
    /// [`make_room`](Self::make_room).
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.storage.len(), "commit past capacity");
        self.end += n;
    }

    /// Drop up to `n` bytes from the head. Consuming everything resets
    /// both cursors so the full storage becomes writable again.
    pub fn consume(&mut self, n: usize) {
        self.begin += n.min(self.size());
        if self.begin == self.end {
            self.begin = 0;
            self.end = 0;
        }
    }

    /// Append a byte slice, reserving as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        let room = self.make_room(bytes.len());
        room[..bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    /// Move `other`'s readable bytes into `self`, leaving `other` empty.
    /// When `self` is empty the storages are swapped instead of copied.
    pub fn absorb(&mut self, other: &mut Buffer) {
        if self.is_empty() {
            std::mem::swap(&mut self.storage, &mut other.storage);
            std::mem::swap(&mut self.begin, &mut other.begin);
            std::mem::swap(&mut self.end, &mut other.end);
        } else {
            self.append(other.data());
        }
        other.begin = 0;
        other.end = 0;
    }

    /// Drop all readable bytes and release the storage.
    pub fn clear(&mut self) {
        self.storage = Vec::new();
        self.begin = 0;
        self.end = 0;
    }

    fn move_head(&mut self) {
        self.storage.copy_within(self.begin..self.end, 0);
        self.end -= self.begin;
        self.begin = 0;
    }

    fn expand(&mut self, cap: usize) {
        let mut next = vec![0; cap];
        let len = self.size();
        next[..len].copy_from_slice(&self.storage[self.begin..self.end]);
        self.storage = next;
        self.begin = 0;
        self.end = len;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        let mut b = Buffer::with_capacity(self.size());
        b.append(self.data());
        b.grow_hint = self.grow_hint;
        b
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_consume() {
        let mut buf = Buffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.data(), b"hello world");
        assert_eq!(buf.size(), 11);

        buf.consume(6);
        assert_eq!(buf.data(), b"world");

        // Consuming more than available drains the buffer.
        buf.consume(100);
        assert!(buf.is_empty());
        assert_eq!(buf.data(), b"");
    }

    #[test]
    fn test_consume_resets_cursors() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.consume(3);
        assert_eq!(buf.size(), 0);
        // Cursors reset, so the whole storage is writable again.
        assert_eq!(buf.space(), buf.capacity());
    }

    #[test]
    fn test_make_room_commit() {
        let mut buf = Buffer::new();
        let room = buf.make_room(4);
        assert!(room.len() >= 4);
        room[..4].copy_from_slice(b"abcd");
        buf.commit(4);
        assert_eq!(buf.data(), b"abcd");
    }

    #[test]
    fn test_compaction_prefers_head_shift() {
        let mut buf = Buffer::with_capacity(64);
        buf.append(&[7u8; 60]);
        buf.consume(58); // 2 readable bytes, head far along
        let cap_before = buf.capacity();
        buf.make_room(8); // 2 + 8 < 64 / 2 => head shift, no growth
        assert_eq!(buf.capacity(), cap_before);
        assert_eq!(buf.size(), 2);
    }

    #[test]
    fn test_growth_when_compaction_insufficient() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[1u8; 12]);
        buf.make_room(32);
        assert!(buf.capacity() >= 12 + 32);
        assert_eq!(buf.size(), 12);
    }

    #[test]
    fn test_absorb_swaps_into_empty() {
        let mut a = Buffer::new();
        let mut b = Buffer::new();
        b.append(b"payload");
        a.absorb(&mut b);
        assert_eq!(a.data(), b"payload");
        assert!(b.is_empty());
    }

    #[test]
    fn test_absorb_appends_into_nonempty() {
        let mut a = Buffer::new();
        let mut b = Buffer::new();
        a.append(b"head-");
        b.append(b"tail");
        a.absorb(&mut b);
        assert_eq!(a.data(), b"head-tail");
        assert!(b.is_empty());
    }

    #[test]
    fn test_clone_is_deep() {
        let mut a = Buffer::new();
        a.append(b"xyz");
        let b = a.clone();
        a.consume(3);
        assert_eq!(b.data(), b"xyz");
    }
}
