//! Fixed-width encodings of the file header and record headers.
//!
//! Every integer on disk is native-endian for the machine that created the
//! file. A handle opened on a foreign-endian file sets `convert` and every
//! field passes through `swap_bytes` on the way in and out.

use trivdb_core::{
    Error, Offset, RecordState, Result, ALIGNMENT, FORMAT_VERSION, FREELIST_TOP, HEADER_SIZE,
    HEADER_RESERVED_WORDS, MAGIC_FOOD, MAGIC_FOOD_LEN, OFFSET_SIZE, RECORD_HEADER_SIZE,
};

#[inline]
pub(crate) fn decode_u32(bytes: &[u8], convert: bool) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    let value = u32::from_ne_bytes(word);
    if convert {
        value.swap_bytes()
    } else {
        value
    }
}

#[inline]
pub(crate) fn encode_u32(value: u32, convert: bool) -> [u8; 4] {
    if convert {
        value.swap_bytes().to_ne_bytes()
    } else {
        value.to_ne_bytes()
    }
}

pub(crate) fn align_up(len: u32, align: u32) -> Result<u32> {
    len.checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or_else(|| Error::invalid(format!("length {len} too large")))
}

/// Length of a record able to hold `payload` bytes of key and value
pub(crate) fn record_length(payload: usize) -> Result<u32> {
    let payload = u32::try_from(payload)
        .map_err(|_| Error::invalid(format!("record of {payload} bytes exceeds 4 GiB")))?;
    let with_tailer = payload
        .checked_add(OFFSET_SIZE)
        .ok_or_else(|| Error::invalid("record length overflows"))?;
    align_up(with_tailer, ALIGNMENT)
}

/// Offset of the head pointer of `bucket`
#[inline]
pub(crate) fn bucket_top(bucket: u32) -> u32 {
    FREELIST_TOP + (bucket + 1) * OFFSET_SIZE
}

/// First byte after the bucket-head array
#[inline]
pub(crate) fn data_start(hash_size: u32) -> u32 {
    FREELIST_TOP + (hash_size + 1) * OFFSET_SIZE
}

/// Cached copy of the file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub version: u32,
    pub hash_size: u32,
    pub rwlocks: u32,
    pub recovery_start: u32,
    pub sequence_number: u32,
    pub magic1_hash: u32,
    pub magic2_hash: u32,
}

impl Header {
    pub fn new(hash_size: u32, magic1_hash: u32, magic2_hash: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            hash_size,
            rwlocks: 0,
            recovery_start: 0,
            sequence_number: 0,
            magic1_hash,
            magic2_hash,
        }
    }

    pub fn encode(&self, convert: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE as usize);
        let mut food = [0u8; MAGIC_FOOD_LEN];
        food[..MAGIC_FOOD.len()].copy_from_slice(MAGIC_FOOD);
        out.extend_from_slice(&food);
        for word in [
            self.version,
            self.hash_size,
            self.rwlocks,
            self.recovery_start,
            self.sequence_number,
            self.magic1_hash,
            self.magic2_hash,
        ] {
            out.extend_from_slice(&encode_u32(word, convert));
        }
        out.resize(out.len() + HEADER_RESERVED_WORDS * 4, 0);
        debug_assert_eq!(out.len(), HEADER_SIZE as usize);
        out
    }

    /// Checks the magic string and returns the header plus whether the file
    /// is byte-swapped relative to this machine.
    pub fn decode(bytes: &[u8]) -> Result<(Self, bool)> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(Error::corrupt("header truncated"));
        }
        if &bytes[..MAGIC_FOOD.len()] != MAGIC_FOOD {
            return Err(Error::corrupt("bad magic string"));
        }
        let raw_version = decode_u32(&bytes[32..], false);
        let convert = if raw_version == FORMAT_VERSION {
            false
        } else if raw_version == FORMAT_VERSION.swap_bytes() {
            true
        } else {
            return Err(Error::corrupt(format!(
                "unsupported format version {raw_version:#x}"
            )));
        };
        let word = |i: usize| decode_u32(&bytes[32 + i * 4..], convert);
        Ok((
            Self {
                version: word(0),
                hash_size: word(1),
                rwlocks: word(2),
                recovery_start: word(3),
                sequence_number: word(4),
                magic1_hash: word(5),
                magic2_hash: word(6),
            },
            convert,
        ))
    }
}

/// Fixed part of every record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub next: Offset,
    pub rec_len: u32,
    pub key_len: u32,
    pub data_len: u32,
    pub full_hash: u32,
    pub magic: u32,
}

impl RecordHeader {
    pub const SIZE: usize = RECORD_HEADER_SIZE as usize;

    pub fn encode(&self, convert: bool) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (i, word) in [
            self.next.get(),
            self.rec_len,
            self.key_len,
            self.data_len,
            self.full_hash,
            self.magic,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&encode_u32(word, convert));
        }
        out
    }

    pub fn decode(bytes: &[u8], convert: bool) -> Self {
        let word = |i: usize| decode_u32(&bytes[i * 4..], convert);
        Self {
            next: Offset::new(word(0)),
            rec_len: word(1),
            key_len: word(2),
            data_len: word(3),
            full_hash: word(4),
            magic: word(5),
        }
    }

    pub fn state(&self) -> Option<RecordState> {
        RecordState::from_magic(self.magic)
    }

    pub fn is_dead(&self) -> bool {
        self.state() == Some(RecordState::Tombstone)
    }

    /// Bytes available for key and value before the tailer
    pub fn capacity(&self) -> u32 {
        self.rec_len.saturating_sub(OFFSET_SIZE)
    }

    /// Header plus body, i.e. the distance to the next record
    pub fn total_size(&self) -> u32 {
        RECORD_HEADER_SIZE.saturating_add(self.rec_len)
    }

    /// The value the trailing word of this record must hold
    pub fn tailer(&self) -> u32 {
        self.total_size()
    }

    pub fn payload_len(&self) -> u32 {
        self.key_len.saturating_add(self.data_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trivdb_core::ACTIVE_MAGIC;

    #[test]
    fn test_header_size_and_swap_detection() {
        let header = Header::new(131, 7, 9);
        let native = header.encode(false);
        assert_eq!(native.len(), HEADER_SIZE as usize);
        let (decoded, convert) = Header::decode(&native).unwrap();
        assert!(!convert);
        assert_eq!(decoded, header);

        let swapped = header.encode(true);
        let (decoded, convert) = Header::decode(&swapped).unwrap();
        assert!(convert);
        assert_eq!(decoded.hash_size, 131);
    }

    #[test]
    fn test_header_rejects_foreign_files() {
        let mut bytes = Header::new(1, 0, 0).encode(false);
        bytes[0] = b'X';
        assert!(Header::decode(&bytes).is_err());
        assert!(Header::decode(&bytes[..40]).is_err());
    }

    #[test]
    fn test_record_header_fields() {
        let rec = RecordHeader {
            next: Offset::new(1000),
            rec_len: 36,
            key_len: 3,
            data_len: 5,
            full_hash: 0xdead_beef,
            magic: ACTIVE_MAGIC,
        };
        let bytes = rec.encode(true);
        assert_eq!(RecordHeader::decode(&bytes, true), rec);
        assert_ne!(RecordHeader::decode(&bytes, false), rec);
        assert_eq!(rec.capacity(), 32);
        assert_eq!(rec.tailer(), 60);
    }

    #[test]
    fn test_record_length_rounds_to_alignment() {
        assert_eq!(record_length(0).unwrap(), 4);
        assert_eq!(record_length(5).unwrap(), 12);
        assert_eq!(record_length(8).unwrap(), 12);
        assert_eq!(data_start(131), FREELIST_TOP + 132 * 4);
        assert_eq!(bucket_top(0), FREELIST_TOP + 4);
    }
}
