//! # Composite Buffer
//!
//! A logical byte sequence made of several [`Bytes`] components, referenced without
//! copying. The encoder gathers the header and every payload section into one composite;
//! the transport then either writes the components one after another (TCP) or flattens
//! them into one datagram (UDP).
//!
//! Components are laid out back to back: component `i` covers `[offset, end_offset)` of the
//! logical address space and the next one starts where it ends.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Default number of components before the buffer consolidates itself.
pub const DEFAULT_MAX_COMPONENTS: usize = 16;

#[derive(Debug, Clone)]
struct Component {
    buf: Bytes,
    length: usize,
    offset: usize,
    end_offset: usize,
}

#[derive(Debug, Clone)]
pub struct CompositeBuffer {
    components: Vec<Component>,
    max_components: usize,
    reader_index: usize,
}

impl Default for CompositeBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMPONENTS)
    }
}

impl CompositeBuffer {
    pub fn new(max_components: usize) -> Self {
        Self {
            components: Vec::new(),
            max_components: max_components.max(1),
            reader_index: 0,
        }
    }

    /// Builds a composite from `buffers`, in order.
    pub fn from_buffers<I>(buffers: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut composite = Self::default();
        for buf in buffers {
            composite.add_component(buf);
        }
        composite
    }

    /// Appends a component. Empty buffers are ignored. When the component count would
    /// exceed the configured maximum, all components are merged into one.
    pub fn add_component(&mut self, buf: Bytes) -> &mut Self {
        if buf.is_empty() {
            return self;
        }
        let offset = self.capacity();
        let length = buf.len();
        self.components.push(Component {
            buf,
            length,
            offset,
            end_offset: offset + length,
        });
        if self.components.len() > self.max_components {
            self.consolidate();
        }
        self
    }

    fn consolidate(&mut self) {
        let capacity = self.capacity();
        let mut merged = BytesMut::with_capacity(capacity);
        for c in &self.components {
            merged.put_slice(&c.buf);
        }
        self.components.clear();
        self.components.push(Component {
            buf: merged.freeze(),
            length: capacity,
            offset: 0,
            end_offset: capacity,
        });
    }

    pub fn capacity(&self) -> usize {
        self.components.last().map(|c| c.end_offset).unwrap_or(0)
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// The component buffers, in order.
    pub fn components(&self) -> impl Iterator<Item = &Bytes> {
        self.components.iter().map(|c| &c.buf)
    }

    fn check_index(&self, index: usize, length: usize) -> Result<()> {
        let capacity = self.capacity();
        match index.checked_add(length) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(ProtocolError::IndexOutOfBounds { index, capacity }),
        }
    }

    /// Returns the component containing `offset`.
    ///
    /// # Errors
    /// `IndexOutOfBounds` if `offset` is not below the capacity.
    pub fn to_component_index(&self, offset: usize) -> Result<usize> {
        let capacity = self.capacity();
        if offset >= capacity {
            return Err(ProtocolError::IndexOutOfBounds {
                index: offset,
                capacity,
            });
        }
        let (mut low, mut high) = (0usize, self.components.len());
        while low < high {
            let mid = low + (high - low) / 2;
            let c = &self.components[mid];
            if offset >= c.end_offset {
                low = mid + 1;
            } else if offset < c.offset {
                high = mid;
            } else {
                return Ok(mid);
            }
        }
        // ranges are contiguous from 0 to capacity, so the search always hits
        Err(ProtocolError::IndexOutOfBounds {
            index: offset,
            capacity,
        })
    }

    /// Zero-copy views of `[index, index + length)`, one per touched component.
    pub fn nio_buffers(&self, index: usize, length: usize) -> Result<Vec<Bytes>> {
        self.check_index(index, length)?;
        if length == 0 {
            return Ok(Vec::new());
        }
        let mut buffers = Vec::with_capacity(self.components.len());
        let mut i = self.to_component_index(index)?;
        let (mut index, mut length) = (index, length);
        while length > 0 {
            let c = &self.components[i];
            let local = index - c.offset;
            let local_length = length.min(c.length - local);
            buffers.push(c.buf.slice(local..local + local_length));
            index += local_length;
            length -= local_length;
            i += 1;
        }
        Ok(buffers)
    }

    /// A single buffer for `[index, index + length)`. Zero-copy when the range lies in
    /// one component, otherwise the pieces are copied into a new buffer.
    pub fn nio_buffer(&self, index: usize, length: usize) -> Result<Bytes> {
        let mut buffers = self.nio_buffers(index, length)?;
        match buffers.len() {
            0 => Ok(Bytes::new()),
            1 => Ok(buffers.remove(0)),
            _ => {
                let mut merged = BytesMut::with_capacity(length);
                for b in &buffers {
                    merged.put_slice(b);
                }
                Ok(merged.freeze())
            }
        }
    }

    pub fn get_u8(&self, index: usize) -> Result<u8> {
        let i = self.to_component_index(index)?;
        let c = &self.components[i];
        Ok(c.buf[index - c.offset])
    }

    /// The whole content as one buffer.
    pub fn to_bytes(&self) -> Bytes {
        self.nio_buffer(0, self.capacity()).unwrap_or_default()
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn readable_bytes(&self) -> usize {
        self.capacity() - self.reader_index
    }

    /// Reads `length` bytes at the reader index and advances it.
    pub fn read_bytes(&mut self, length: usize) -> Result<Bytes> {
        let out = self.nio_buffer(self.reader_index, length)?;
        self.reader_index += length;
        Ok(out)
    }

    pub fn skip_bytes(&mut self, length: usize) -> Result<()> {
        self.check_index(self.reader_index, length)?;
        self.reader_index += length;
        Ok(())
    }
}
