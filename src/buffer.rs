use core::borrow::BorrowMut;
use core::cmp;

/// A linear buffer that allows block access without extra copies but moves already
/// read data down more often than strictly necessary.
///
/// wpos points to the first byte that can be written, rpos points at the next byte
/// that can be read.
///
/// invariants: 0 <= rpos <= wpos <= data.len()
pub struct Buffer<S: BorrowMut<[u8]>> {
    store: S,
    rpos: usize,
    wpos: usize,
}

impl<S: BorrowMut<[u8]>> Buffer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            rpos: 0,
            wpos: 0,
        }
    }

    // Clears the buffer
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    // Amount of bytes available for reading
    pub fn available_read(&self) -> usize {
        self.wpos - self.rpos
    }

    // Amount of space in bytes available for writing
    pub fn available_write(&self) -> usize {
        self.available_write_without_discard() + self.rpos
    }

    pub fn capacity(&self) -> usize {
        self.store.borrow().len()
    }

    fn available_write_without_discard(&self) -> usize {
        self.store.borrow().len() - self.wpos
    }

    // Writes as much as possible of data to the buffer and returns the number of bytes written
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.len() > self.available_write_without_discard() && self.rpos > 0 {
            // data doesn't fit in already available space, and there is data to discard
            self.discard_already_read_data();
        }

        let count = cmp::min(self.available_write_without_discard(), data.len());
        if count == 0 {
            // Buffer is full (or data is empty)
            return 0;
        }

        self.store.borrow_mut()[self.wpos..self.wpos + count].copy_from_slice(&data[..count]);

        self.wpos += count;
        count
    }

    // Takes up to max_count bytes from the buffer and passes a slice pointing to them to a closure
    // for reading. The closure returns the number of bytes it consumed.
    pub fn read(&mut self, max_count: usize, f: impl FnOnce(&[u8]) -> usize) -> usize {
        let count = cmp::min(max_count, self.available_read());

        let consumed = cmp::min(f(&self.store.borrow()[self.rpos..self.rpos + count]), count);
        self.rpos += consumed;
        if self.rpos == self.wpos {
            self.clear();
        }
        consumed
    }

    fn discard_already_read_data(&mut self) {
        let (rpos, wpos) = (self.rpos, self.wpos);
        self.store.borrow_mut().copy_within(rpos..wpos, 0);

        self.wpos -= self.rpos;
        self.rpos = 0;
    }
}
