use std::fmt;

use crate::config::MIB;

const LARGE_FILE: u64 = 100 * MIB;
const MEDIUM_FILE: u64 = 10 * MIB;
const SMALL_FILE: u64 = MIB;

const FAST_LINK: f64 = (10 * MIB) as f64;
const MEDIUM_LINK: f64 = MIB as f64;

pub const LARGE_BUFFER: usize = 64 * 1024;
pub const MEDIUM_BUFFER: usize = 32 * 1024;
pub const SMALL_BUFFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkClass {
    #[default]
    Wifi,
    FiveG,
    FourG,
    ThreeG,
    Unknown,
}

impl NetworkClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkClass::Wifi => "wifi",
            NetworkClass::FiveG => "5g",
            NetworkClass::FourG => "4g",
            NetworkClass::ThreeG => "3g",
            NetworkClass::Unknown => "unknown",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "wifi" => Some(NetworkClass::Wifi),
            "5g" => Some(NetworkClass::FiveG),
            "4g" => Some(NetworkClass::FourG),
            "3g" => Some(NetworkClass::ThreeG),
            "unknown" => Some(NetworkClass::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn worker_count(total_size: u64, network: NetworkClass) -> u32 {
    if total_size > LARGE_FILE {
        match network {
            NetworkClass::Wifi => 12,
            NetworkClass::FiveG => 8,
            NetworkClass::FourG => 6,
            NetworkClass::ThreeG | NetworkClass::Unknown => 4,
        }
    } else if total_size > MEDIUM_FILE {
        8
    } else if total_size > SMALL_FILE {
        6
    } else {
        4
    }
}

pub fn buffer_size(throughput_bytes_per_sec: f64) -> usize {
    if throughput_bytes_per_sec > FAST_LINK {
        LARGE_BUFFER
    } else if throughput_bytes_per_sec > MEDIUM_LINK {
        MEDIUM_BUFFER
    } else {
        SMALL_BUFFER
    }
}

pub fn chunk_size(total_size: u64, worker_count: u32, min_chunk: u64, max_chunk: u64) -> u64 {
    let base = total_size / u64::from(worker_count.max(1));
    base.clamp(min_chunk, max_chunk.max(min_chunk))
}

// Clamping means `workers * chunk_size` rarely equals the file size, so the
// number of chunks actually planned is recomputed from the chosen size.
pub fn effective_worker_count(total_size: u64, requested: u32, chunk_size: u64) -> u32 {
    let by_size = (total_size / chunk_size.max(1)).max(1);
    let by_size = u32::try_from(by_size).unwrap_or(u32::MAX);
    requested.max(1).min(by_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_tiers() {
        assert_eq!(worker_count(200 * MIB, NetworkClass::Wifi), 12);
        assert_eq!(worker_count(200 * MIB, NetworkClass::FiveG), 8);
        assert_eq!(worker_count(200 * MIB, NetworkClass::FourG), 6);
        assert_eq!(worker_count(200 * MIB, NetworkClass::ThreeG), 4);
        assert_eq!(worker_count(200 * MIB, NetworkClass::Unknown), 4);
        assert_eq!(worker_count(12 * MIB, NetworkClass::Wifi), 8);
        assert_eq!(worker_count(12 * MIB, NetworkClass::ThreeG), 8);
        assert_eq!(worker_count(5 * MIB, NetworkClass::Wifi), 6);
        assert_eq!(worker_count(MIB, NetworkClass::Wifi), 4);
        assert_eq!(worker_count(0, NetworkClass::Wifi), 4);
    }

    #[test]
    fn test_buffer_size_tiers() {
        assert_eq!(buffer_size(50.0 * MIB as f64), LARGE_BUFFER);
        assert_eq!(buffer_size(2.0 * MIB as f64), MEDIUM_BUFFER);
        assert_eq!(buffer_size(100.0), SMALL_BUFFER);
        assert_eq!(buffer_size(0.0), SMALL_BUFFER);
    }

    #[test]
    fn test_chunk_size_clamps() {
        assert_eq!(chunk_size(12 * MIB, 8, 2 * MIB, 10 * MIB), 2 * MIB);
        assert_eq!(chunk_size(500 * MIB, 4, 2 * MIB, 10 * MIB), 10 * MIB);
        assert_eq!(chunk_size(100, 0, 2 * MIB, 10 * MIB), 2 * MIB);
    }

    #[test]
    fn test_reconciliation_for_25_mib() {
        let total = 25 * MIB;
        let size = chunk_size(total, 12, 2 * MIB, 10 * MIB);
        // 25 MiB / 12 is already inside the bounds, so no clamping happens.
        assert_eq!(size, total / 12);
        assert_eq!(effective_worker_count(total, 12, size), 12);
        // Clamped to the lower bound the count still comes out at 12.
        assert_eq!(effective_worker_count(total, 12, 2 * MIB), 12);
    }

    #[test]
    fn test_reconciliation_for_12_mib() {
        let total = 12 * MIB;
        let requested = worker_count(total, NetworkClass::Wifi);
        let size = chunk_size(total, requested, 2 * MIB, 10 * MIB);
        assert_eq!(requested, 8);
        assert_eq!(size, 2 * MIB);
        assert_eq!(effective_worker_count(total, requested, size), 6);
    }

    #[test]
    fn test_effective_count_never_zero() {
        assert_eq!(effective_worker_count(10, 8, 2 * MIB), 1);
        assert_eq!(effective_worker_count(10, 0, 1), 1);
    }

    #[test]
    fn test_network_class_parse() {
        assert_eq!(NetworkClass::from_str("WiFi"), Some(NetworkClass::Wifi));
        assert_eq!(NetworkClass::from_str("5g"), Some(NetworkClass::FiveG));
        assert_eq!(NetworkClass::from_str("lte"), None);
        assert_eq!(NetworkClass::FourG.to_string(), "4g");
    }
}
