//! Key and value codecs.
//!
//! A codec turns a typed value into the bytes the engine stores and back.
//! Codecs are zero-sized markers picked through `TypedStore`'s type
//! parameters.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{TypedError, TypedResult};

pub trait Codec<T> {
    fn encode(value: &T) -> TypedResult<Vec<u8>>;
    fn decode(bytes: &[u8]) -> TypedResult<T>;
}

/// Bytes stored as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn encode(value: &Vec<u8>) -> TypedResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(bytes: &[u8]) -> TypedResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(value: &String) -> TypedResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> TypedResult<String> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(TypedError::codec)
    }
}

/// Fixed-width integers in little-endian byte order.
pub trait LeInt: Sized {
    const WIDTH: usize;
    fn to_le_vec(&self) -> Vec<u8>;
    fn from_le_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_le_int {
    ($($t:ty),* $(,)?) => {
        $(
            impl LeInt for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn to_le_vec(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                    <[u8; std::mem::size_of::<$t>()]>::try_from(bytes)
                        .ok()
                        .map(<$t>::from_le_bytes)
                }
            }
        )*
    };
}

impl_le_int!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

#[derive(Debug, Clone, Copy, Default)]
pub struct LeCodec<T>(PhantomData<fn() -> T>);

impl<T: LeInt> Codec<T> for LeCodec<T> {
    fn encode(value: &T) -> TypedResult<Vec<u8>> {
        Ok(value.to_le_vec())
    }

    fn decode(bytes: &[u8]) -> TypedResult<T> {
        T::from_le_slice(bytes).ok_or_else(|| {
            TypedError::Codec(format!("expected {} bytes, found {}", T::WIDTH, bytes.len()))
        })
    }
}

/// Any serde type, encoded with bincode.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec<T>(PhantomData<fn() -> T>);

impl<T: Serialize + DeserializeOwned> Codec<T> for BincodeCodec<T> {
    fn encode(value: &T) -> TypedResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode(bytes: &[u8]) -> TypedResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        label: String,
    }

    #[test]
    fn test_utf8_rejects_invalid_bytes() {
        assert_eq!(Utf8Codec::decode(b"caf\xc3\xa9").unwrap(), "café");
        assert!(matches!(Utf8Codec::decode(&[0xff, 0xfe]), Err(TypedError::Codec(_))));
    }

    #[test]
    fn test_le_layout_and_width_check() {
        assert_eq!(LeCodec::<u32>::encode(&0x0102_0304).unwrap(), vec![4, 3, 2, 1]);
        assert_eq!(LeCodec::<i16>::decode(&[0xff, 0xff]).unwrap(), -1);
        let err = LeCodec::<u64>::decode(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.to_string(), "codec error: expected 8 bytes, found 3");
    }

    #[test]
    fn test_bincode_struct() {
        let p = Point { x: -7, label: "home".to_string() };
        let bytes = BincodeCodec::<Point>::encode(&p).unwrap();
        assert_eq!(BincodeCodec::<Point>::decode(&bytes).unwrap(), p);
        assert!(BincodeCodec::<Point>::decode(&bytes[..3]).is_err());
    }
}
