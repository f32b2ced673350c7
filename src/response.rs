//! Append-only positive response buffer
//!
//! A [PositiveResponse] owns the pre-sized response storage of a connection and
//! exposes a bounded window of it to jobs. All appends are bounds checked, a write
//! that does not fit is rejected as a whole and latches the overflow flag.

/// Bounds checked response writer over a pre-sized buffer
#[derive(Debug, Clone)]
pub struct PositiveResponse {
    buffer: Box<[u8]>,
    start: usize,
    max_length: usize,
    length: usize,
    overflow: bool,
}

impl PositiveResponse {
    /// Creates a response buffer with `capacity` bytes of storage. The window is empty until
    /// [PositiveResponse::init] is called
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            start: 0,
            max_length: 0,
            length: 0,
            overflow: false,
        }
    }

    /// Binds the writable window `[start, start + max_length)` of the storage
    /// and rewinds the write cursor.
    ///
    /// ## Panics
    /// If the window does not fit into the storage
    pub fn init(&mut self, start: usize, max_length: usize) {
        assert!(
            start + max_length <= self.buffer.len(),
            "response window {start}+{max_length} exceeds storage of {} bytes",
            self.buffer.len()
        );
        self.start = start;
        self.max_length = max_length;
        self.reset();
    }

    /// Rewinds the write cursor without touching the bound window
    pub fn reset(&mut self) {
        self.length = 0;
        self.overflow = false;
    }

    /// Number of bytes written
    pub fn length(&self) -> usize {
        self.length
    }

    /// Size of the bound window
    pub fn maximum_length(&self) -> usize {
        self.max_length
    }

    /// Bytes that can still be appended
    pub fn available_length(&self) -> usize {
        self.max_length - self.length
    }

    /// True once a write was rejected for lack of space
    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// Bytes written so far
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.start..self.start + self.length]
    }

    /// Unwritten remainder of the window, for out of band writes. Commit them
    /// with [PositiveResponse::increase_length]
    pub fn available_mut(&mut self) -> &mut [u8] {
        let from = self.start + self.length;
        &mut self.buffer[from..self.start + self.max_length]
    }

    /// Appends a single byte
    pub fn append_u8(&mut self, data: u8) -> bool {
        self.append_exact(&[data])
    }

    /// Appends a big-endian u16
    pub fn append_u16(&mut self, data: u16) -> bool {
        self.append_exact(&data.to_be_bytes())
    }

    /// Appends the lower 3 bytes of `data` big-endian
    pub fn append_u24(&mut self, data: u32) -> bool {
        self.append_exact(&data.to_be_bytes()[1..])
    }

    /// Appends a big-endian u32
    pub fn append_u32(&mut self, data: u32) -> bool {
        self.append_exact(&data.to_be_bytes())
    }

    /// Appends as many bytes of `data` as fit into the window. Returns the number of bytes
    /// written, the overflow flag is set if that is less than `data.len()`
    pub fn append_data(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.available_length());
        if count < data.len() {
            self.overflow = true;
        }
        let from = self.start + self.length;
        self.buffer[from..from + count].copy_from_slice(&data[..count]);
        self.length += count;
        count
    }

    /// Commits `n` bytes that were written through [PositiveResponse::available_mut]
    ///
    /// ## Panics
    /// If `n` exceeds the available length
    pub fn increase_length(&mut self, n: usize) {
        assert!(
            n <= self.available_length(),
            "increase_length({n}) exceeds available length {}",
            self.available_length()
        );
        self.length += n;
    }

    fn append_exact(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.available_length() {
            self.overflow = true;
            return false;
        }
        self.append_data(bytes);
        true
    }

    pub(crate) fn storage(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_lengths(r: &PositiveResponse) {
        assert_eq!(r.length() + r.available_length(), r.maximum_length());
    }

    #[test]
    fn test_append_big_endian() {
        let mut r = PositiveResponse::new(16);
        r.init(2, 10);
        assert!(r.append_u8(0x01));
        assert!(r.append_u16(0x0203));
        assert!(r.append_u24(0xFF040506));
        assert!(r.append_u32(0x0708090A));
        assert_eq!(r.data(), &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]);
        assert_eq!(r.available_length(), 0);
        assert!(!r.is_overflow());
        assert_lengths(&r);
    }

    #[test]
    fn test_rejected_append_writes_nothing() {
        let mut r = PositiveResponse::new(8);
        r.init(0, 3);
        assert!(r.append_u16(0xAABB));
        assert!(!r.append_u16(0xCCDD));
        assert!(r.is_overflow());
        assert_eq!(r.data(), &[0xAA, 0xBB]);
        assert_eq!(r.storage()[2], 0x00);
        assert_lengths(&r);
    }

    #[test]
    fn test_append_data_never_exceeds_window() {
        let mut r = PositiveResponse::new(8);
        r.init(1, 4);
        assert_eq!(r.append_data(&[1, 2, 3]), 3);
        assert_lengths(&r);
        assert_eq!(r.append_data(&[4, 5, 6]), 1);
        assert!(r.is_overflow());
        assert_eq!(r.data(), &[1, 2, 3, 4]);
        // Bytes past the window are untouched
        assert_eq!(r.storage()[5], 0);
        assert_lengths(&r);
    }

    #[test]
    fn test_reset_keeps_window() {
        let mut r = PositiveResponse::new(8);
        r.init(4, 4);
        r.append_u32(0x01020304);
        r.reset();
        assert_eq!(r.length(), 0);
        assert_eq!(r.maximum_length(), 4);
        assert!(!r.is_overflow());
    }

    #[test]
    fn test_out_of_band_write() {
        let mut r = PositiveResponse::new(8);
        r.init(0, 8);
        r.append_u8(0x62);
        r.available_mut()[..2].copy_from_slice(&[0xF1, 0x90]);
        r.increase_length(2);
        assert_eq!(r.data(), &[0x62, 0xF1, 0x90]);
        assert_lengths(&r);
    }

    #[test]
    #[should_panic]
    fn test_increase_length_past_window() {
        let mut r = PositiveResponse::new(8);
        r.init(0, 2);
        r.increase_length(3);
    }
}
