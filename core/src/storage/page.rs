//! Block addressing and fixed-size pages

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Size of an encoded integer
pub const INT_SIZE: usize = 4;

/// Block number of the sentinel block standing for "the whole file"
pub const END_OF_FILE: i32 = -1;

/// Identifies one block of one file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    file_name: String,
    number: i32,
}

impl BlockId {
    pub fn new(file_name: impl Into<String>, number: i32) -> Self {
        Self {
            file_name: file_name.into(),
            number,
        }
    }

    /// The sentinel block locked while a file is measured or extended.
    pub fn end_of_file(file_name: impl Into<String>) -> Self {
        Self::new(file_name, END_OF_FILE)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    /// Transient blocks live in files named `temp*` and are never logged.
    pub fn is_temporary(&self) -> bool {
        self.file_name.starts_with("temp")
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[file {}, block {}]", self.file_name, self.number)
    }
}

/// Page of raw bytes with positional accessors.
///
/// Integers are 4 bytes little-endian. Strings and byte arrays are stored as
/// a 4-byte length followed by the payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    /// Create a zeroed page of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    /// Wrap existing bytes, used for log records
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Bytes needed to store a string of `len` UTF-8 bytes
    pub fn max_length(len: usize) -> usize {
        INT_SIZE + len
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_int(&self, offset: usize) -> i32 {
        let mut buf = [0u8; INT_SIZE];
        buf.copy_from_slice(&self.data[offset..offset + INT_SIZE]);
        i32::from_le_bytes(buf)
    }

    pub fn set_int(&mut self, offset: usize, value: i32) {
        self.data[offset..offset + INT_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    /// # Panics
    ///
    /// If the length prefix at `offset` does not describe bytes inside the
    /// page.
    pub fn get_bytes(&self, offset: usize) -> &[u8] {
        self.try_get_bytes(offset).unwrap_or_else(|| {
            panic!(
                "length prefix {} at offset {} overflows a {}-byte page",
                self.get_int(offset),
                offset,
                self.data.len()
            )
        })
    }

    /// Bytes at `offset`, or `None` when the length prefix is negative or
    /// runs past the end of the page
    pub fn try_get_bytes(&self, offset: usize) -> Option<&[u8]> {
        let start = offset.checked_add(INT_SIZE)?;
        if start > self.data.len() {
            return None;
        }
        let len = usize::try_from(self.get_int(offset)).ok()?;
        self.data.get(start..start.checked_add(len)?)
    }

    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + Self::max_length(bytes.len()) <= self.data.len(),
            "{} bytes at offset {} overflow a {}-byte page",
            bytes.len(),
            offset,
            self.data.len()
        );
        self.set_int(offset, bytes.len() as i32);
        let start = offset + INT_SIZE;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn get_string(&self, offset: usize) -> String {
        String::from_utf8_lossy(self.get_bytes(offset)).into_owned()
    }

    /// String at `offset` if the cell holds a well-formed UTF-8 string
    pub fn try_get_string(&self, offset: usize) -> Option<String> {
        let bytes = self.try_get_bytes(offset)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    pub fn set_string(&mut self, offset: usize, value: &str) {
        self.set_bytes(offset, value.as_bytes());
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("len", &self.data.len()).finish()
    }
}
