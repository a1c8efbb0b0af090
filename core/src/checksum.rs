use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "md5" => Some(ChecksumType::Md5),
            "sha1" => Some(ChecksumType::Sha1),
            "sha256" => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRequest {
    pub checksum_type: ChecksumType,
    pub expected_hex: String,
}

impl ChecksumRequest {
    pub fn new(checksum_type: ChecksumType, expected_hex: impl Into<String>) -> Self {
        Self {
            checksum_type,
            expected_hex: expected_hex.into(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (algo, hex) = value.split_once(':')?;
        let checksum_type = ChecksumType::from_str(algo.trim())?;
        let hex = hex.trim();
        if hex.is_empty() || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self::new(checksum_type, hex))
    }
}

pub fn file_digest(path: &Path, checksum_type: ChecksumType) -> CoreResult<String> {
    match checksum_type {
        ChecksumType::Md5 => digest_file::<Md5>(path),
        ChecksumType::Sha1 => digest_file::<Sha1>(path),
        ChecksumType::Sha256 => digest_file::<Sha256>(path),
    }
}

pub fn verify_checksum(path: &Path, req: &ChecksumRequest) -> CoreResult<()> {
    let actual = file_digest(path, req.checksum_type)?;
    if actual.eq_ignore_ascii_case(&req.expected_hex) {
        Ok(())
    } else {
        Err(CoreError::ChecksumMismatch {
            expected: req.expected_hex.to_ascii_lowercase(),
            actual,
        })
    }
}

fn digest_file<D: Digest>(path: &Path) -> CoreResult<String> {
    let file = File::open(path).map_err(|err| CoreError::io(path, err))?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buf = [0u8; 1024 * 64];
    loop {
        let read = reader.read(&mut buf).map_err(|err| CoreError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
