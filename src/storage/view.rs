//! # Byte Views
//!
//! Positional fixed-width integer access over byte slices, and the
//! [`Record`] view a store hands out on every read.
//!
//! `Record` is the tagged view the store contract is built around: a
//! mapped backend returns a borrowed slice of its live mapping (zero
//! copy), while a descriptor backend returns a pooled buffer it just
//! filled. Either way the caller sees `&[u8]` of exactly one record and
//! must consume it before issuing another read, since pooled slots are
//! recycled, and mapped bytes may be rewritten by a later operation.
//! Callers that need the bytes to outlive the next call must copy.

use std::ops::Deref;

use crate::storage::buffers::PooledBuf;

/// Positional little-endian integer access over a byte slice.
///
/// Out-of-range offsets panic, as slice indexing does; stores bounds-check
/// record indexes before handing out views, so offsets within a record are
/// the caller's contract.
pub trait ByteView {
    fn get_u8(&self, offset: usize) -> u8;
    fn get_i8(&self, offset: usize) -> i8;
    fn get_u16(&self, offset: usize) -> u16;
    fn get_i16(&self, offset: usize) -> i16;
    fn get_u32(&self, offset: usize) -> u32;
    fn get_i32(&self, offset: usize) -> i32;
    fn get_i64(&self, offset: usize) -> i64;

    fn put_u8(&mut self, offset: usize, value: u8);
    fn put_i8(&mut self, offset: usize, value: i8);
    fn put_u16(&mut self, offset: usize, value: u16);
    fn put_i16(&mut self, offset: usize, value: i16);
    fn put_u32(&mut self, offset: usize, value: u32);
    fn put_i32(&mut self, offset: usize, value: i32);
    fn put_i64(&mut self, offset: usize, value: i64);
}

macro_rules! le_accessors {
    ($($get:ident / $put:ident : $ty:ty [$width:expr]),* $(,)?) => {
        $(
            #[inline]
            fn $get(&self, offset: usize) -> $ty {
                let mut raw = [0u8; $width];
                raw.copy_from_slice(&self[offset..offset + $width]);
                <$ty>::from_le_bytes(raw)
            }

            #[inline]
            fn $put(&mut self, offset: usize, value: $ty) {
                self[offset..offset + $width].copy_from_slice(&value.to_le_bytes());
            }
        )*
    };
}

impl ByteView for [u8] {
    le_accessors! {
        get_u8 / put_u8: u8 [1],
        get_i8 / put_i8: i8 [1],
        get_u16 / put_u16: u16 [2],
        get_i16 / put_i16: i16 [2],
        get_u32 / put_u32: u32 [4],
        get_i32 / put_i32: i32 [4],
        get_i64 / put_i64: i64 [8],
    }
}

/// One record's bytes, as returned by [`Storage::read`].
///
/// Mapped backends alias their live mapping; descriptor backends return a
/// pooled copy. Do not hold onto a `Record` across further store calls.
///
/// [`Storage::read`]: crate::storage::Storage::read
#[derive(Debug)]
pub enum Record<'a> {
    /// A borrowed slice of a live memory mapping.
    Mapped(&'a [u8]),
    /// An owned pooled buffer, returned to its pool on drop.
    Pooled(PooledBuf),
}

impl Deref for Record<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match self {
            Record::Mapped(bytes) => bytes,
            Record::Pooled(buf) => buf,
        }
    }
}

impl AsRef<[u8]> for Record<'_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}
