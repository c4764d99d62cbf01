//! Work package container
//!
//! A WorkPackage is the unit of work handed from the Distributor to a
//! Receiver and from a Receiver to one of its workers. It is an element
//! count plus an opaque payload of length-prefixed records:
//!
//! ```text
//! ┌──────────────┬───────────────┬───────────┬─────────────┐
//! │ key_len: u32 │ value_len: u64│ key bytes │ value bytes │  × num_elements
//! └──────────────┴───────────────┴───────────┴─────────────┘
//! ```
//!
//! All integers are little-endian. `value_len` may be zero.

use crate::error::PackageError;

const KEY_LEN_SIZE: usize = 4;
const VALUE_LEN_SIZE: usize = 8;
const RECORD_HEADER_SIZE: usize = KEY_LEN_SIZE + VALUE_LEN_SIZE;

/// A batch of key/value records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPackage {
    num_elements: u64,
    data: Vec<u8>,
}

/// One record borrowed from a package payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageRecord<'a> {
    pub key: &'a str,
    pub value: &'a [u8],
}

impl WorkPackage {
    /// Create an empty package
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassemble a package received as payload plus element count
    pub fn from_parts(data: Vec<u8>, num_elements: u64) -> Self {
        Self { num_elements, data }
    }

    /// Append one record and count it
    pub fn push_record(&mut self, key: &str, value: &[u8]) {
        self.data.reserve(RECORD_HEADER_SIZE + key.len() + value.len());
        self.data
            .extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.data
            .extend_from_slice(&(value.len() as u64).to_le_bytes());
        self.data.extend_from_slice(key.as_bytes());
        self.data.extend_from_slice(value);
        self.num_elements += 1;
    }

    pub fn num_elements(&self) -> u64 {
        self.num_elements
    }

    pub fn is_empty(&self) -> bool {
        self.num_elements == 0
    }

    /// Raw payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn into_parts(self) -> (Vec<u8>, u64) {
        (self.data, self.num_elements)
    }

    /// Iterate over the packed records in order
    pub fn records(&self) -> Records<'_> {
        Records {
            data: &self.data,
            offset: 0,
            remaining: self.num_elements,
        }
    }

    /// Check that the payload holds exactly `num_elements` well-formed records
    pub fn validate(&self) -> Result<(), PackageError> {
        let mut actual = 0u64;
        let mut records = Records {
            data: &self.data,
            offset: 0,
            remaining: u64::MAX,
        };
        while records.offset < self.data.len() {
            match records.next() {
                Some(Ok(_)) => actual += 1,
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        if actual != self.num_elements {
            return Err(PackageError::CountMismatch {
                declared: self.num_elements,
                actual,
            });
        }
        Ok(())
    }
}

/// Iterator over the records of a package
pub struct Records<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: u64,
}

impl<'a> Records<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], PackageError> {
        let available = self.data.len() - self.offset;
        if len > available {
            return Err(PackageError::Truncated {
                offset: self.offset,
                needed: len - available,
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_record(&mut self) -> Result<PackageRecord<'a>, PackageError> {
        let start = self.offset;
        let header = self.take(RECORD_HEADER_SIZE)?;
        let mut key_len = [0u8; KEY_LEN_SIZE];
        key_len.copy_from_slice(&header[..KEY_LEN_SIZE]);
        let mut value_len = [0u8; VALUE_LEN_SIZE];
        value_len.copy_from_slice(&header[KEY_LEN_SIZE..]);

        let key_len = u32::from_le_bytes(key_len) as usize;
        let value_len = usize::try_from(u64::from_le_bytes(value_len)).map_err(|_| {
            PackageError::Truncated {
                offset: start,
                needed: usize::MAX,
            }
        })?;

        let key = self.take(key_len)?;
        let key = std::str::from_utf8(key).map_err(|_| PackageError::InvalidKey { offset: start })?;
        let value = self.take(value_len)?;
        Ok(PackageRecord { key, value })
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<PackageRecord<'a>, PackageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.offset >= self.data.len() {
            return None;
        }
        self.remaining -= 1;
        match self.read_record() {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                // Stop after the first malformed record
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_package() {
        let package = WorkPackage::new();
        assert!(package.is_empty());
        assert_eq!(package.size(), 0);
        assert_eq!(package.records().count(), 0);
        assert!(package.validate().is_ok());
    }

    #[test]
    fn test_record_layout() {
        let mut package = WorkPackage::new();
        package.push_record("ab", b"xyz");

        let mut expected = Vec::new();
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(&3u64.to_le_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(b"xyz");
        assert_eq!(package.data(), expected.as_slice());
        assert_eq!(package.num_elements(), 1);
    }

    #[test]
    fn test_reassembled_package_preserves_order_and_empty_values() {
        let mut package = WorkPackage::new();
        package.push_record("first", b"1");
        package.push_record("empty", b"");
        package.push_record("third", &[0u8, 255, 7]);

        let (data, count) = package.clone().into_parts();
        let received = WorkPackage::from_parts(data, count);
        assert_eq!(received, package);

        let records: Vec<_> = received
            .records()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, "first");
        assert_eq!(records[1].key, "empty");
        assert!(records[1].value.is_empty());
        assert_eq!(records[2].value, &[0u8, 255, 7]);
    }

    #[test]
    fn test_truncated_payload() {
        let mut package = WorkPackage::new();
        package.push_record("key", b"value");
        let (mut data, count) = package.into_parts();
        data.truncate(data.len() - 2);

        let broken = WorkPackage::from_parts(data, count);
        let result: Vec<_> = broken.records().collect();
        assert_eq!(result.len(), 1);
        assert!(matches!(result[0], Err(PackageError::Truncated { needed: 2, .. })));
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_count_mismatch() {
        let mut package = WorkPackage::new();
        package.push_record("a", b"1");
        package.push_record("b", b"2");
        let (data, _) = package.into_parts();

        let wrong = WorkPackage::from_parts(data, 3);
        assert_eq!(
            wrong.validate(),
            Err(PackageError::CountMismatch {
                declared: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_invalid_key() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&[0xff, 0xfe]);

        let package = WorkPackage::from_parts(data, 1);
        let first = package.records().next().unwrap();
        assert_eq!(first, Err(PackageError::InvalidKey { offset: 0 }));
    }
}
