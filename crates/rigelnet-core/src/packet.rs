//! Binary packet buffer.
//!
//! A [`Packet`] is the unit of (de)serialization for both handshake control
//! data and RPC arguments. Writes only ever append; reads advance a cursor
//! and happen at most once per byte.
//!
//! Every multi-byte scalar is stored big-endian so peers interoperate
//! regardless of host byte order. Variable-length values carry a `u32`
//! prefix: strings their UTF-8 byte length, sequences their element count,
//! nested packets their byte length.
//!
//! Two read styles are offered:
//!
//! - [`Packet::extract`] never fails. A short read poisons the packet and
//!   yields `T::default()`; every later extraction fails the same way until
//!   [`Packet::clear`] is called.
//! - [`Packet::extract_or_err`] reports the failure as a [`PacketError`] and
//!   leaves both the cursor and the validity flag untouched.

use crate::error::PacketError;
use std::fmt;

/// Types that can be appended to a [`Packet`]
pub trait Encode {
    /// Append the big-endian encoding of `self` to `out`.
    fn encode(&self, out: &mut Vec<u8>);
}

/// Types that can be extracted from a [`Packet`]
pub trait Decode: Sized {
    /// Decode a value from the front of `input`, advancing it past the
    /// consumed bytes.
    ///
    /// # Errors
    /// Returns `PacketError` if `input` does not start with a complete
    /// encoding. `input` may have been partially advanced in that case.
    fn decode(input: &mut &[u8]) -> Result<Self, PacketError>;
}

/// Split `n` bytes off the front of `input`.
fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], PacketError> {
    if input.len() < n {
        return Err(PacketError::ReadPastEnd {
            requested: n,
            remaining: input.len(),
        });
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

fn encode_len(len: usize, out: &mut Vec<u8>) {
    let len = u32::try_from(len).unwrap_or_else(|_| panic!("length {len} does not fit a u32 prefix"));
    len.encode(out);
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }
            }

            impl Decode for $ty {
                #[inline]
                fn decode(input: &mut &[u8]) -> Result<Self, PacketError> {
                    const SIZE: usize = std::mem::size_of::<$ty>();
                    let bytes = take(input, SIZE)?;
                    let mut raw = [0u8; SIZE];
                    raw.copy_from_slice(bytes);
                    Ok(<$ty>::from_be_bytes(raw))
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Encode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(input: &mut &[u8]) -> Result<Self, PacketError> {
        Ok(u8::decode(input)? != 0)
    }
}

impl Encode for str {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_len(self.len(), out);
        out.extend_from_slice(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_str().encode(out);
    }
}

impl Decode for String {
    fn decode(input: &mut &[u8]) -> Result<Self, PacketError> {
        let len = u32::decode(input)? as usize;
        let bytes = take(input, len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| PacketError::InvalidUtf8)
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_len(self.len(), out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_slice().encode(out);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, PacketError> {
        let count = u32::decode(input)? as usize;
        // Bounds allocation by the bytes actually present.
        if count > input.len() {
            return Err(PacketError::ReadPastEnd {
                requested: count,
                remaining: input.len(),
            });
        }
        let mut items = Vec::with_capacity(count.min(input.len()));
        for _ in 0..count {
            items.push(T::decode(input)?);
        }
        Ok(items)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, out: &mut Vec<u8>) {
        (**self).encode(out);
    }
}

impl Encode for () {
    fn encode(&self, _out: &mut Vec<u8>) {}
}

impl Decode for () {
    fn decode(_input: &mut &[u8]) -> Result<Self, PacketError> {
        Ok(())
    }
}

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode(&self, out: &mut Vec<u8>) {
                let ($($name,)+) = self;
                $($name.encode(out);)+
            }
        }

        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(input: &mut &[u8]) -> Result<Self, PacketError> {
                Ok(($($name::decode(input)?,)+))
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);
impl_tuple!(A, B, C, D, E);
impl_tuple!(A, B, C, D, E, F);
impl_tuple!(A, B, C, D, E, F, G);
impl_tuple!(A, B, C, D, E, F, G, H);

/// Append-only binary buffer with a single read cursor
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    read_pos: usize,
    invalid: bool,
}

impl Packet {
    /// Create an empty packet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty packet with room for `capacity` bytes
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Wrap received bytes for extraction
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: bytes.into(),
            ..Self::default()
        }
    }

    /// Append the encoding of `value`
    pub fn append<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(&mut self.data);
        self
    }

    /// Append raw bytes with no length prefix
    pub fn append_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Extract a value, poisoning the packet on failure.
    ///
    /// Returns `T::default()` if the packet is already poisoned or the
    /// remaining bytes do not hold a complete `T`.
    pub fn extract<T: Decode + Default>(&mut self) -> T {
        match self.extract_or_err() {
            Ok(value) => value,
            Err(_) => {
                self.invalid = true;
                T::default()
            }
        }
    }

    /// Extract a value without poisoning the packet.
    ///
    /// On failure the read position is left where it was.
    ///
    /// # Errors
    /// Returns `PacketError::Poisoned` if an earlier [`extract`](Self::extract)
    /// failed, otherwise the decoding error.
    pub fn extract_or_err<T: Decode>(&mut self) -> Result<T, PacketError> {
        if self.invalid {
            return Err(PacketError::Poisoned);
        }
        let mut input = &self.data[self.read_pos..];
        let before = input.len();
        let value = T::decode(&mut input)?;
        self.read_pos += before - input.len();
        Ok(value)
    }

    /// Extract exactly `len` raw bytes.
    ///
    /// # Errors
    /// Returns `PacketError` if fewer than `len` bytes remain or the packet
    /// is poisoned.
    pub fn extract_bytes(&mut self, len: usize) -> Result<&[u8], PacketError> {
        if self.invalid {
            return Err(PacketError::Poisoned);
        }
        let mut input = &self.data[self.read_pos..];
        let bytes = take(&mut input, len)?;
        self.read_pos += len;
        Ok(bytes)
    }

    /// Reset to an empty, valid packet
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.invalid = false;
    }

    /// Total number of bytes written
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Current read cursor
    #[must_use]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Bytes not yet extracted
    #[must_use]
    pub fn remaining_data_size(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// The unread tail of the packet
    #[must_use]
    pub fn remaining_bytes(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    /// Whether every extraction so far succeeded
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.invalid
    }

    /// Whether the cursor has reached the end of the data
    #[must_use]
    pub fn end_of_packet(&self) -> bool {
        self.read_pos >= self.data.len()
    }

    /// Whether nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// All bytes written so far, regardless of the read cursor
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the packet, returning its bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("read_pos", &self.read_pos)
            .field("valid", &!self.invalid)
            .finish()
    }
}

impl Encode for Packet {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_len(self.data.len(), out);
        out.extend_from_slice(&self.data);
    }
}

impl Decode for Packet {
    fn decode(input: &mut &[u8]) -> Result<Self, PacketError> {
        let len = u32::decode(input)? as usize;
        Ok(Packet::from_bytes(take(input, len)?))
    }
}
