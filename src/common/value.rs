//! Values that can be stored in the DHT.
use std::convert::TryInto;

use bytes::Bytes;

use crate::{Error, Result};

/// Maximum encoded size of a value, checked before any request is sent.
///
/// Keeps a store message comfortably inside one datagram.
pub const MAX_VALUE_SIZE: usize = 8 * 1024;

const INTEGER_TAG: u8 = b'i';
const FLOAT_TAG: u8 = b'f';
const BOOLEAN_TAG: u8 = b'b';
const TEXT_TAG: u8 = b's';
const BYTES_TAG: u8 = b'x';

#[derive(Debug, Clone, PartialEq)]
/// A value storable in the DHT.
///
/// The network only carries scalars, text and raw bytes; compound values are
/// the caller's to encode.
pub enum Value {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
    Bytes(Bytes),
}

impl Value {
    /// Symmetric byte encoding carried in store and find_value messages.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Integer(n) => {
                let mut bytes = vec![INTEGER_TAG];
                bytes.extend_from_slice(&n.to_be_bytes());
                bytes
            }
            Value::Float(x) => {
                let mut bytes = vec![FLOAT_TAG];
                bytes.extend_from_slice(&x.to_bits().to_be_bytes());
                bytes
            }
            Value::Boolean(b) => vec![BOOLEAN_TAG, *b as u8],
            Value::Text(s) => {
                let mut bytes = vec![TEXT_TAG];
                bytes.extend_from_slice(s.as_bytes());
                bytes
            }
            Value::Bytes(b) => {
                let mut bytes = vec![BYTES_TAG];
                bytes.extend_from_slice(b);
                bytes
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Value> {
        let (tag, rest) = bytes.split_first().ok_or(Error::InvalidValueEncoding)?;

        match *tag {
            INTEGER_TAG => {
                let raw: [u8; 8] = rest.try_into().map_err(|_| Error::InvalidValueEncoding)?;
                Ok(Value::Integer(i64::from_be_bytes(raw)))
            }
            FLOAT_TAG => {
                let raw: [u8; 8] = rest.try_into().map_err(|_| Error::InvalidValueEncoding)?;
                Ok(Value::Float(f64::from_bits(u64::from_be_bytes(raw))))
            }
            BOOLEAN_TAG => match rest {
                [0] => Ok(Value::Boolean(false)),
                [1] => Ok(Value::Boolean(true)),
                _ => Err(Error::InvalidValueEncoding),
            },
            TEXT_TAG => String::from_utf8(rest.to_vec())
                .map(Value::Text)
                .map_err(|_| Error::InvalidValueEncoding),
            BYTES_TAG => Ok(Value::Bytes(Bytes::copy_from_slice(rest))),
            _ => Err(Error::InvalidValueEncoding),
        }
    }

    /// Returns [Error::ValueTooLarge] if the encoded value would not fit in a
    /// store message. Called before any network activity.
    pub fn check_size(&self) -> Result<()> {
        let len = match self {
            Value::Text(s) => s.len() + 1,
            Value::Bytes(b) => b.len() + 1,
            _ => 9,
        };

        if len > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge(len));
        }

        Ok(())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Value {
        Value::Bytes(bytes.into())
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Value {
        Value::Bytes(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encoding_is_symmetric() {
        let values = vec![
            Value::from(-42_i64),
            Value::from(3.14),
            Value::from(true),
            Value::from(false),
            Value::from("text"),
            Value::from(""),
            Value::from(b"bytes".to_vec()),
        ];

        for value in values {
            assert_eq!(Value::from_bytes(&value.to_bytes()).expect("decodes"), value);
        }
    }

    #[test]
    fn undecodable_bytes_are_rejected() {
        assert!(Value::from_bytes(&[]).is_err());
        assert!(Value::from_bytes(&[b'z', 1, 2]).is_err());
        assert!(Value::from_bytes(&[INTEGER_TAG, 1, 2]).is_err());
        assert!(Value::from_bytes(&[BOOLEAN_TAG, 7]).is_err());
        assert!(Value::from_bytes(&[TEXT_TAG, 0xff, 0xfe]).is_err());
    }

    #[test]
    fn size_check() {
        assert!(Value::from(1.5).check_size().is_ok());
        assert!(Value::from(vec![0_u8; MAX_VALUE_SIZE - 1]).check_size().is_ok());

        let too_large = Value::from(vec![0_u8; MAX_VALUE_SIZE]);
        assert!(matches!(
            too_large.check_size(),
            Err(Error::ValueTooLarge(_))
        ));
    }
}
