//! Configuration for the POSIX backends.

use crate::error::ShmError;

/// Default prefix of every OS object name this crate creates.
pub const DEFAULT_NAME_PREFIX: &str = "shmp";

/// Default number of slots in a slot segment.
pub const DEFAULT_SLOT_COUNT: u32 = 1024;

/// Default size of one slot in bytes.
pub const DEFAULT_SLOT_SIZE: u32 = 1024;

/// Default size of a heap segment's data area (16 MiB).
pub const DEFAULT_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Default alignment of heap chunks.
pub const DEFAULT_HEAP_ALIGNMENT: usize = 64;

/// Configuration for [`PosixSlotBackend`](crate::posix::PosixSlotBackend).
#[derive(Debug, Clone)]
pub struct SlotBackendConfig {
    /// Number of equal-size slots in the segment.
    pub slot_count: u32,
    /// Bytes per slot; also the maximum chunk size.
    pub slot_size: u32,
    /// Prefix for the shared-memory object name.
    pub name_prefix: String,
}

impl Default for SlotBackendConfig {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            slot_size: DEFAULT_SLOT_SIZE,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

impl SlotBackendConfig {
    pub fn validate(&self) -> Result<(), ShmError> {
        if self.slot_count == 0 || self.slot_count == u32::MAX {
            return Err(ShmError::InvalidConfig(format!(
                "slot_count {} out of range",
                self.slot_count
            )));
        }
        if self.slot_size == 0 {
            return Err(ShmError::InvalidConfig("slot_size must be non-zero".into()));
        }
        validate_prefix(&self.name_prefix)
    }
}

/// Configuration for [`PosixHeapBackend`](crate::posix::PosixHeapBackend).
#[derive(Debug, Clone)]
pub struct HeapBackendConfig {
    /// Bytes available for chunks (rounded down to `alignment`).
    pub size: usize,
    /// Chunk alignment; chunk ids are byte offsets divided by this.
    pub alignment: usize,
    /// Prefix for the shared-memory object name.
    pub name_prefix: String,
}

impl Default for HeapBackendConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_HEAP_SIZE,
            alignment: DEFAULT_HEAP_ALIGNMENT,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

impl HeapBackendConfig {
    /// Default config with the size given as a string such as `"1GB"`.
    pub fn with_size_str(size: &str) -> Result<Self, ShmError> {
        let config = Self {
            size: parse_size(size)?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ShmError> {
        if !self.alignment.is_power_of_two()
            || self.alignment < 8
            || self.alignment > u32::MAX as usize
        {
            return Err(ShmError::InvalidConfig(format!(
                "alignment {} must be a power of two in 8..=2^31",
                self.alignment
            )));
        }
        if self.size < self.alignment {
            return Err(ShmError::InvalidConfig(format!(
                "size {} is smaller than one aligned chunk",
                self.size
            )));
        }
        // Chunk ids are u32 offsets in alignment units.
        if self.size / self.alignment > u32::MAX as usize {
            return Err(ShmError::InvalidConfig(format!(
                "size {} too large for alignment {}",
                self.size, self.alignment
            )));
        }
        validate_prefix(&self.name_prefix)
    }
}

fn validate_prefix(prefix: &str) -> Result<(), ShmError> {
    if prefix.is_empty()
        || prefix.len() > 64
        || !prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(ShmError::InvalidConfig(format!(
            "name prefix {prefix:?} must be 1-64 chars of [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

/// Parse a human size string. Multiples are binary: `"1KB"` is 1024 bytes.
pub fn parse_size(input: &str) -> Result<usize, ShmError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let invalid = || ShmError::InvalidConfig(format!("invalid size {input:?}"));

    let value: usize = digits.parse().map_err(|_| invalid())?;
    let shift = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        _ => return Err(invalid()),
    };
    value.checked_mul(1usize << shift).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4KB").unwrap(), 4096);
        assert_eq!(parse_size(" 16 MiB ").unwrap(), 16 << 20);
        assert_eq!(parse_size("1GB").unwrap(), 1 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("GB").is_err());
        assert!(parse_size("12XB").is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let slot = SlotBackendConfig::default();
        assert_eq!((slot.slot_count, slot.slot_size), (1024, 1024));
        slot.validate().unwrap();
        HeapBackendConfig::default().validate().unwrap();
        assert_eq!(HeapBackendConfig::with_size_str("1GB").unwrap().size, 1 << 30);
    }

    #[test]
    fn test_rejects_bad_values() {
        let slot = SlotBackendConfig {
            slot_size: 0,
            ..Default::default()
        };
        assert_eq!(
            slot.validate().unwrap_err().kind(),
            ErrorKind::ConstraintViolation
        );

        let heap = HeapBackendConfig {
            alignment: 48,
            ..Default::default()
        };
        assert!(heap.validate().is_err());

        // Chunk ids and the segment header carry the alignment as a u32.
        #[cfg(target_pointer_width = "64")]
        {
            let heap = HeapBackendConfig {
                size: 1 << 33,
                alignment: 1 << 32,
                ..Default::default()
            };
            assert!(matches!(heap.validate(), Err(ShmError::InvalidConfig(_))));
            let heap = HeapBackendConfig {
                size: 1 << 32,
                alignment: 1 << 31,
                ..Default::default()
            };
            heap.validate().unwrap();
        }

        let prefix = SlotBackendConfig {
            name_prefix: "a/b".into(),
            ..Default::default()
        };
        assert!(prefix.validate().is_err());
    }
}
