//! Kademlia node Id or a lookup target
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The highest possible bucket height between two Ids.
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Map an arbitrary key into the Id space with a SHA-1 digest.
    ///
    /// Keys and node Ids share one space, so values land on the nodes whose
    /// Ids are closest to the key's digest.
    pub fn from_key<T: AsRef<[u8]>>(key: T) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(key.as_ref());

        Id(hasher.digest().bytes())
    }

    /// XOR this Id with another.
    ///
    /// The result, compared as an unsigned integer, is the Kademlia distance
    /// metric; it is symmetric and satisfies the triangle inequality, which is
    /// what justifies bucket-based routing.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Simplified XOR distance between this Id and a target Id, used as the
    /// routing table bucket index.
    ///
    /// The height is the number of trailing non zero bits in the XOR result.
    ///
    /// Height to self is 0.
    /// Height to the furthest Id is 160.
    /// Height to an Id with 5 leading matching bits is 155.
    pub fn bucket_height(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    /// Generate a random Id whose bucket height relative to this Id is exactly
    /// `height`, used as the lookup target when refreshing a stale bucket.
    pub fn random_in_bucket(&self, height: u8) -> Id {
        debug_assert!(height >= 1 && height <= MAX_DISTANCE);

        let mut bytes = self.0;
        let mut rng = rand::thread_rng();

        // The first differing bit, counting from the most significant.
        let bit = (MAX_DISTANCE - height) as usize;
        let byte = bit / 8;
        let mask = 0x80_u8 >> (bit % 8);

        bytes[byte] ^= mask;

        // Randomize every less significant bit.
        let low_mask = mask - 1;
        bytes[byte] = (bytes[byte] & !low_mask) | (rng.gen::<u8>() & low_mask);
        for b in bytes.iter_mut().skip(byte + 1) {
            *b = rng.gen();
        }

        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        // Byte length, so multi-byte characters can never pass as hex digits.
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.into()));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (byte, chunk) in bytes.iter_mut().zip(s.as_bytes().chunks(2)) {
            let chunk = std::str::from_utf8(chunk).map_err(|_| Error::InvalidIdEncoding(s.into()))?;
            *byte = u8::from_str_radix(chunk, 16).map_err(|_| Error::InvalidIdEncoding(s.into()))?;
        }

        Ok(Id(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..10 {
            let a = Id::random();
            let b = Id::random();

            assert_eq!(a.xor(&b), b.xor(&a));
            assert_eq!(a.bucket_height(&b), b.bucket_height(&a));
        }
    }

    #[test]
    fn distance_to_self_is_zero() {
        let id = Id::random();

        assert_eq!(id.xor(&id), Id([0; ID_SIZE]));
        assert_eq!(id.bucket_height(&id), 0);
    }

    #[test]
    fn from_key_is_deterministic() {
        assert_eq!(Id::from_key("some key"), Id::from_key("some key"));
        assert_ne!(Id::from_key("some key"), Id::from_key("other key"));
    }

    #[test]
    fn random_in_bucket_has_expected_height() {
        let id = Id::random();

        for height in 1..=MAX_DISTANCE {
            let other = id.random_in_bucket(height);

            assert_eq!(id.bucket_height(&other), height);
        }
    }

    #[test]
    fn hex_roundtrip() {
        let id = Id::random();
        let parsed: Id = id.to_string().parse().expect("valid hex");

        assert_eq!(parsed, id);

        assert!("not hex".parse::<Id>().is_err());
        assert!("5a3ce9".parse::<Id>().is_err());

        // 40 bytes of multi-byte characters: an error, never a slice panic.
        let multi_byte = format!("{}a", "\u{0800}".repeat(13));
        assert_eq!(multi_byte.len(), ID_SIZE * 2);
        assert!(multi_byte.parse::<Id>().is_err());
    }

    #[test]
    fn closer_means_smaller_xor() {
        let target: Id = "5a3ce9c14e7a08645677bbd1cfe7d8f956d53256"
            .parse()
            .expect("valid hex");
        let near: Id = "5a3ce9c14e7a08645677bbd1cfe7d8f956d53257"
            .parse()
            .expect("valid hex");
        let far: Id = "fb449c17f6c34fadea26a5a83e1952e815e001ea"
            .parse()
            .expect("valid hex");

        assert!(target.xor(&near) < target.xor(&far));
    }
}
