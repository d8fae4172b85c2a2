// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-stream buffer with read and write cursors

use std::io;
use std::ops::Deref;

/// A growable, contiguous byte buffer with two advancing cursors.
///
/// Invariant: `0 <= read <= write <= capacity`. Writers append at the write
/// cursor, readers consume at the read cursor. `reserve` first reclaims the
/// space before the read cursor by compacting, and only grows the allocation
/// when compaction cannot make room, and then to exactly the requested
/// bound rather than a doubling.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Buffer {
        Buffer::default()
    }

    /// The number of bytes available to read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.write - self.read
    }

    /// The number of bytes that can be written without reallocating.
    #[inline]
    pub fn remaining_mut(&self) -> usize {
        self.data.len() - self.write
    }

    /// Returns true when no bytes are waiting to be read.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// The readable region.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// The writable region. Pair with [`Buffer::mark_written`].
    #[inline]
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data[self.write..]
    }

    /// Consumes `n` bytes (clamped to the readable region).
    pub fn mark_read(&mut self, n: usize) {
        self.read = self.write.min(self.read + n);
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    /// Records `n` bytes written into [`Buffer::space`].
    pub fn mark_written(&mut self, n: usize) {
        self.write = self.data.len().min(self.write + n);
    }

    /// Guarantees at least `n` writable bytes: compacts in place when the
    /// space before the read cursor plus the tail suffices, otherwise grows
    /// the capacity to exactly `write + n`.
    pub fn reserve(&mut self, n: usize) {
        if self.remaining_mut() >= n {
            return;
        }
        if self.read + self.remaining_mut() >= n {
            self.data.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
            return;
        }
        self.data.resize(self.write + n, 0);
    }

    /// Appends `bytes` at the write cursor.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.space()[..bytes.len()].copy_from_slice(bytes);
        self.mark_written(bytes.len());
    }

    /// Removes and returns up to `n` bytes from the front.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.remaining());
        let out = self.data[self.read..self.read + n].to_vec();
        self.mark_read(n);
        out
    }

    /// Removes and returns one full line including its trailing `\n`, or
    /// `None` when no newline has arrived yet.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let at = self.as_slice().iter().position(|&b| b == b'\n')?;
        Some(self.take(at + 1))
    }

    /// Resets both cursors, discarding all content.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
