/// Constants describing the on-disk format
// Header
pub const MAGIC_FOOD: &[u8] = b"TDB file\n";
pub const MAGIC_FOOD_LEN: usize = 32;
pub const FORMAT_VERSION: u32 = 0x2601_1967 + 6;
pub const HEADER_SIZE: u32 = 168;
pub const HEADER_RESERVED_WORDS: usize = 27;

// Field offsets inside the header
pub const VERSION_OFFSET: u32 = 32;
pub const HASH_SIZE_OFFSET: u32 = 36;
pub const RWLOCKS_OFFSET: u32 = 40;
pub const RECOVERY_HEAD: u32 = 44;
pub const SEQNUM_OFFSET: u32 = 48;
pub const MAGIC1_HASH_OFFSET: u32 = 52;
pub const MAGIC2_HASH_OFFSET: u32 = 56;

/// Offset of the free-list head, logically hash bucket -1
pub const FREELIST_TOP: u32 = HEADER_SIZE;

// Record layout
pub const OFFSET_SIZE: u32 = 4;
pub const RECORD_HEADER_SIZE: u32 = 24;
pub const RECORD_MAGIC_OFFSET: u32 = 20;
pub const ALIGNMENT: u32 = 4;
pub const MIN_REC_SIZE: u32 = RECORD_HEADER_SIZE + OFFSET_SIZE + 8;

// Record state tags
pub const ACTIVE_MAGIC: u32 = 0x2601_1999;
pub const FREE_MAGIC: u32 = !ACTIVE_MAGIC;
pub const DEAD_MAGIC: u32 = 0xFEE1_DEAD;
pub const RECOVERY_MAGIC: u32 = 0xF53B_C0E7;
pub const RECOVERY_INVALID_MAGIC: u32 = 0;

// Lock offsets
pub const GLOBAL_LOCK: u32 = 0;
pub const ACTIVE_LOCK: u32 = 4;
pub const TRANSACTION_LOCK: u32 = 8;

// Defaults
pub const DEFAULT_HASH_SIZE: u32 = 131;
pub const DEFAULT_PAGE_SIZE: u32 = 0x2000;

/// Largest bucket count whose head array still fits below 4 GiB
pub const MAX_HASH_SIZE: u32 = (u32::MAX - HEADER_SIZE) / OFFSET_SIZE - 2;

// Strings hashed into the header to fingerprint the hash function
pub const HASH_CHECK_1: &[u8] = b"TDB file\n";
pub const HASH_CHECK_2: &[u8] = b"Don't walk on the wild side, ok?";

// Environment variables read by the tool
pub const TRIVDB_LOG_VAR: &str = "TRIVDB_LOG";
