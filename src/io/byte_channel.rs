//! Growable byte buffer with head and tail access.
//!
//! `RawBuf` is the only place in this crate that manipulates raw memory.
//! Every public operation on [`ByteChannel`] goes through safe, bounds-checked
//! slices over the allocation, and every operation after [`ByteChannel::release`]
//! fails with [`Error::Released`] instead of touching freed memory.

#![allow(unsafe_code)]

use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default initial capacity of a channel.
pub const DEFAULT_CAPACITY: usize = 256;

/// Sleep between checks in [`ByteChannel::wait_for`].
const WAIT_STEP: Duration = Duration::from_millis(1);

/// A zero-initialised heap allocation of `capacity` bytes.
///
/// Invariants:
/// - `ptr` is valid for `capacity` initialised bytes (dangling when `capacity == 0`).
/// - The allocation is freed exactly once, in `Drop`.
struct RawBuf {
    ptr: NonNull<u8>,
    capacity: usize,
}

// The allocation is exclusively owned and only reached through `&mut self`.
unsafe impl Send for RawBuf {}

impl RawBuf {
    fn layout(capacity: usize) -> Layout {
        Layout::array::<u8>(capacity)
            .unwrap_or_else(|_| panic!("byte channel capacity overflow: {}", capacity))
    }

    fn with_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            return Self {
                ptr: NonNull::dangling(),
                capacity: 0,
            };
        }

        let layout = Self::layout(capacity);
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, capacity }
    }

    /// Reallocate to `new_capacity`, copying the old content and zeroing the new tail.
    fn grow(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            return;
        }

        if self.capacity == 0 {
            *self = Self::with_capacity(new_capacity);
            return;
        }

        let old_layout = Self::layout(self.capacity);
        let new_layout = Self::layout(new_capacity);
        // SAFETY: ptr was allocated with old_layout; new size is non-zero and
        // fits isize (checked by Layout::array above).
        let raw = unsafe { alloc::realloc(self.ptr.as_ptr(), old_layout, new_layout.size()) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(new_layout));
        // SAFETY: [capacity, new_capacity) lies inside the new allocation.
        unsafe {
            ptr::write_bytes(ptr.as_ptr().add(self.capacity), 0, new_capacity - self.capacity);
        }
        self.ptr = ptr;
        self.capacity = new_capacity;
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for `capacity` initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for `capacity` initialised bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        if self.capacity > 0 {
            // SAFETY: allocated with this exact layout and never freed elsewhere.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.capacity)) };
        }
    }
}

struct Inner {
    /// `None` once released.
    buf: Option<RawBuf>,
    size: usize,
}

impl Inner {
    fn buf(&mut self) -> Result<&mut RawBuf> {
        self.buf.as_mut().ok_or(Error::Released)
    }

    fn ensure_available(&mut self, needed: usize) -> Result<()> {
        let size = self.size;
        let buf = self.buf()?;
        if buf.capacity - size < needed {
            // Grows by exactly the shortfall of this write, no doubling.
            let new_capacity = buf.capacity + needed;
            buf.grow(new_capacity);
        }
        Ok(())
    }
}

/// What [`ByteChannel::wait_for`] waits for.
#[derive(Debug, Clone, Copy)]
pub enum Want<'a> {
    /// At least this many bytes buffered.
    Len(usize),
    /// The mark present somewhere in the buffer.
    Mark(&'a [u8]),
}

/// Off-heap growable byte buffer.
///
/// Valid data always occupies `[0, size)`. Writes may go to either end, reads
/// consume from either end. All operations are serialized by an internal lock.
pub struct ByteChannel {
    inner: Mutex<Inner>,
}

impl ByteChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: Some(RawBuf::with_capacity(capacity)),
                size: 0,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let guard = self.inner.lock();
        if guard.buf.is_none() {
            return Err(Error::Released);
        }
        Ok(guard)
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().buf.is_none()
    }

    /// Free the allocation. Calling it again is a no-op.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.buf.take().is_some() {
            inner.size = 0;
        }
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.lock()?.size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    pub fn capacity(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        Ok(inner.buf()?.capacity)
    }

    /// Free space before the next write has to grow the allocation.
    pub fn available(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let size = inner.size;
        Ok(inner.buf()?.capacity - size)
    }

    /// Append `src`, growing if needed. Returns the number of bytes written.
    pub fn write_tail(&self, src: &[u8]) -> Result<usize> {
        let mut inner = self.lock()?;
        if src.is_empty() {
            return Ok(0);
        }

        inner.ensure_available(src.len())?;
        let size = inner.size;
        inner.buf()?.as_mut_slice()[size..size + src.len()].copy_from_slice(src);
        inner.size += src.len();
        Ok(src.len())
    }

    /// Prepend `src`, moving the existing bytes toward the tail.
    pub fn write_head(&self, src: &[u8]) -> Result<usize> {
        let mut inner = self.lock()?;
        if src.is_empty() {
            return Ok(0);
        }

        inner.ensure_available(src.len())?;
        let size = inner.size;
        let data = inner.buf()?.as_mut_slice();
        data.copy_within(0..size, src.len());
        data[..src.len()].copy_from_slice(src);
        inner.size += src.len();
        Ok(src.len())
    }

    /// Consume up to `n` bytes from the front.
    pub fn read_head(&self, n: usize) -> Result<Bytes> {
        let mut inner = self.lock()?;
        let size = inner.size;
        let n = n.min(size);
        if n == 0 {
            return Ok(Bytes::new());
        }

        let data = inner.buf()?.as_mut_slice();
        let out = Bytes::copy_from_slice(&data[..n]);
        data.copy_within(n..size, 0);
        inner.size -= n;
        Ok(out)
    }

    /// Consume up to `n` bytes from the back.
    pub fn read_tail(&self, n: usize) -> Result<Bytes> {
        let mut inner = self.lock()?;
        let size = inner.size;
        let n = n.min(size);
        if n == 0 {
            return Ok(Bytes::new());
        }

        let out = Bytes::copy_from_slice(&inner.buf()?.as_slice()[size - n..size]);
        inner.size -= n;
        Ok(out)
    }

    /// Drop bytes without reading them.
    ///
    /// A positive `offset` truncates that many bytes from the tail, a negative
    /// one removes `|offset|` bytes from the head. Returns `false` and leaves
    /// the buffer untouched when `|offset|` exceeds the buffered size.
    pub fn shrink(&self, offset: isize) -> Result<bool> {
        let mut inner = self.lock()?;
        let size = inner.size;
        let amount = offset.unsigned_abs();
        if amount > size {
            return Ok(false);
        }

        if offset > 0 {
            inner.size -= amount;
        } else if offset < 0 {
            inner.buf()?.as_mut_slice().copy_within(amount..size, 0);
            inner.size -= amount;
        }
        Ok(true)
    }

    /// Discard everything buffered.
    pub fn clear(&self) -> Result<()> {
        self.lock()?.size = 0;
        Ok(())
    }

    /// Byte at `offset`, or `None` past the buffered data.
    pub fn get(&self, offset: usize) -> Result<Option<u8>> {
        let mut inner = self.lock()?;
        let size = inner.size;
        if offset >= size {
            return Ok(None);
        }
        Ok(Some(inner.buf()?.as_slice()[offset]))
    }

    /// Copy bytes starting at `offset` into `dst` without consuming them.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        let mut inner = self.lock()?;
        let size = inner.size;
        if offset >= size {
            return Ok(0);
        }

        let n = dst.len().min(size - offset);
        dst[..n].copy_from_slice(&inner.buf()?.as_slice()[offset..offset + n]);
        Ok(n)
    }

    /// Snapshot of the buffered bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_view(|data| data.to_vec())
    }

    /// Run `f` over the buffered bytes while holding the lock.
    ///
    /// `f` must not call back into the same channel.
    pub fn with_view<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let mut inner = self.lock()?;
        let size = inner.size;
        Ok(f(&inner.buf()?.as_slice()[..size]))
    }

    /// Run a multi-step edit over the buffered bytes.
    ///
    /// The closure gets a [`ChannelView`] with a read cursor. Whatever the
    /// cursor has passed is removed from the front of the channel when the view
    /// is dropped, including on early return or unwind. `f` must not call back
    /// into the same channel.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut ChannelView<'_>) -> R) -> Result<R> {
        let mut inner = self.lock()?;
        let Inner { buf, size } = &mut *inner;
        let data = match buf.as_mut() {
            Some(buf) => buf.as_mut_slice(),
            None => return Err(Error::Released),
        };

        let mut view = ChannelView {
            data,
            size,
            position: 0,
        };
        Ok(f(&mut view))
    }

    /// Offset of the first occurrence of `mark`.
    pub fn index_of(&self, mark: &[u8]) -> Result<Option<usize>> {
        self.with_view(|data| {
            if data.is_empty() {
                None
            } else {
                memchr::memmem::find(data, mark)
            }
        })
    }

    /// Poll until the buffer holds what `want` asks for or `timeout` elapses.
    pub fn wait_for(&self, want: Want<'_>, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = match want {
                Want::Len(len) => self.size()? >= len,
                Want::Mark(mark) => self.index_of(mark)?.is_some(),
            };
            if ready {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(WAIT_STEP);
        }
    }

    /// Consume one line including its `\n`, or `None` if no full line is buffered.
    pub fn read_line(&self) -> Result<Option<String>> {
        match self.index_of(b"\n")? {
            Some(index) => {
                let line = self.read_head(index + 1)?;
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None => Ok(None),
        }
    }

    /// Consume bytes up to the next `mark` and skip the mark itself.
    ///
    /// A mark at the very front is skipped first. Without any mark, the whole
    /// buffer is returned.
    pub fn read_with_split(&self, mark: &[u8]) -> Result<Bytes> {
        if self.size()? == 0 || mark.is_empty() {
            return self.read_head(usize::MAX);
        }

        if self.index_of(mark)? == Some(0) {
            self.shrink(-(mark.len() as isize))?;
        }

        match self.index_of(mark)? {
            Some(index) => {
                let out = self.read_head(index)?;
                self.shrink(-(mark.len() as isize))?;
                Ok(out)
            }
            None => self.read_head(usize::MAX),
        }
    }
}

impl Default for ByteChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ByteChannel {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(buf) = inner.buf.as_ref() {
            debug!(
                "Byte channel dropped without release, freeing {} bytes",
                buf.capacity
            );
        }
    }
}

impl std::fmt::Debug for ByteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        match inner.buf.as_ref() {
            Some(buf) => f
                .debug_struct("ByteChannel")
                .field("size", &inner.size)
                .field("capacity", &buf.capacity)
                .finish(),
            None => f.write_str("ByteChannel(released)"),
        }
    }
}

/// Mutable view handed to [`ByteChannel::with_mut`].
///
/// Bytes before `position` are compacted away when the view drops.
pub struct ChannelView<'a> {
    data: &'a mut [u8],
    size: &'a mut usize,
    position: usize,
}

impl ChannelView<'_> {
    /// Bytes not yet passed by the cursor.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.position..*self.size]
    }

    pub fn unread_mut(&mut self) -> &mut [u8] {
        let size = *self.size;
        &mut self.data[self.position..size]
    }

    /// Move the cursor forward, clamped to the buffered size.
    pub fn advance(&mut self, n: usize) {
        self.position = (self.position + n).min(*self.size);
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        *self.size - self.position
    }
}

impl Drop for ChannelView<'_> {
    fn drop(&mut self) {
        if self.position == 0 {
            return;
        }
        let size = *self.size;
        self.data.copy_within(self.position..size, 0);
        *self.size = size - self.position;
    }
}
