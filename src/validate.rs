//! Structural validation of XCOFF headers.
//!
//! Only the file header is inspected; everything deeper is left to the
//! external tools the analyzers run.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub const MAGIC_XCOFF32: u16 = 0x01DF;
pub const MAGIC_XCOFF64: u16 = 0x01F7;
const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const AIX_SMALL_AR_MAGIC: &[u8; 8] = b"<aiaff>\n";
const AIX_BIG_AR_MAGIC: &[u8; 8] = b"<bigaf>\n";

const XCOFF32_HEADER_SIZE: usize = 20;
const XCOFF64_HEADER_SIZE: usize = 24;
const MAX_SECTIONS: u16 = 1000;
const MAX_OPTIONAL_HEADER: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
    Xcoff32,
    Xcoff64,
    Archive,
    BigArchive,
    Unknown,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Xcoff32 => "xcoff32",
            FileType::Xcoff64 => "xcoff64",
            FileType::Archive => "archive",
            FileType::BigArchive => "big-archive",
            FileType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<FileType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

impl ValidationReport {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            file_type: None,
            error: Some(error.into()),
            details: BTreeMap::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Check that `path` looks like an XCOFF object or an archive. Never fails;
/// problems are described in the report.
pub fn validate(path: &Path) -> ValidationReport {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return ValidationReport::invalid(format!("File not found: {}", path.display())),
    };
    if !metadata.is_file() {
        return ValidationReport::invalid(format!("Not a regular file: {}", path.display()));
    }
    let file_size = metadata.len();

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return ValidationReport::invalid(format!("File not readable: {}", path.display())),
    };
    let mut header = [0u8; XCOFF64_HEADER_SIZE];
    let filled = match read_up_to(&mut file, &mut header) {
        Ok(n) => n,
        Err(e) => return ValidationReport::invalid(format!("I/O error: {}", e)),
    };

    inspect_header(&header[..filled], file_size)
}

/// Validate and turn an invalid report into `Error::InvalidInput`
pub fn require_valid(path: &Path) -> Result<ValidationReport> {
    let report = validate(path);
    if report.valid {
        Ok(report)
    } else {
        let reason = report.error.clone().unwrap_or_else(|| "invalid header".to_string());
        Err(Error::invalid_input(path, reason))
    }
}

/// File type from the header alone; `Unknown` when unreadable or unrecognized
pub fn detect_file_type(path: &Path) -> FileType {
    validate(path).file_type.unwrap_or(FileType::Unknown)
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Validate the first bytes of a file of `file_size` bytes
pub fn inspect_header(header: &[u8], file_size: u64) -> ValidationReport {
    if file_size < XCOFF32_HEADER_SIZE as u64 || header.len() < XCOFF32_HEADER_SIZE {
        return ValidationReport::invalid(format!("File too small: {} bytes", file_size))
            .with_detail("file_size", file_size);
    }

    let archive_type = match &header[..8] {
        m if m == AR_MAGIC || m == AIX_SMALL_AR_MAGIC => Some(FileType::Archive),
        m if m == AIX_BIG_AR_MAGIC => Some(FileType::BigArchive),
        _ => None,
    };
    if let Some(file_type) = archive_type {
        return ValidationReport {
            valid: true,
            file_type: Some(file_type),
            error: None,
            details: BTreeMap::new(),
        }
        .with_detail("file_size", file_size);
    }

    let magic = be_u16(header, 0);
    match magic {
        MAGIC_XCOFF32 => check_xcoff(parse_xcoff32(header), file_size, FileType::Xcoff32),
        MAGIC_XCOFF64 if header.len() >= XCOFF64_HEADER_SIZE => {
            check_xcoff(parse_xcoff64(header), file_size, FileType::Xcoff64)
        }
        MAGIC_XCOFF64 => ValidationReport::invalid(format!("File too small: {} bytes", file_size))
            .with_detail("file_size", file_size),
        other => ValidationReport::invalid(format!("Invalid magic: 0x{:04X}", other))
            .with_detail("magic", format!("0x{:04X}", other))
            .with_detail("file_size", file_size),
    }
}

struct FileHeader {
    magic: u16,
    sections: u16,
    timestamp: u32,
    symbol_table_offset: u64,
    symbol_count: u32,
    optional_header_size: u16,
    flags: u16,
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn be_u64(b: &[u8], at: usize) -> u64 {
    (u64::from(be_u32(b, at)) << 32) | u64::from(be_u32(b, at + 4))
}

/// magic, nscns, timdat, symptr(4), nsyms, opthdr, flags
fn parse_xcoff32(h: &[u8]) -> FileHeader {
    FileHeader {
        magic: be_u16(h, 0),
        sections: be_u16(h, 2),
        timestamp: be_u32(h, 4),
        symbol_table_offset: u64::from(be_u32(h, 8)),
        symbol_count: be_u32(h, 12),
        optional_header_size: be_u16(h, 16),
        flags: be_u16(h, 18),
    }
}

/// magic, nscns, timdat, symptr(8), opthdr, flags, nsyms
fn parse_xcoff64(h: &[u8]) -> FileHeader {
    FileHeader {
        magic: be_u16(h, 0),
        sections: be_u16(h, 2),
        timestamp: be_u32(h, 4),
        symbol_table_offset: be_u64(h, 8),
        optional_header_size: be_u16(h, 16),
        flags: be_u16(h, 18),
        symbol_count: be_u32(h, 20),
    }
}

fn check_xcoff(h: FileHeader, file_size: u64, file_type: FileType) -> ValidationReport {
    let mut problems = Vec::new();
    if h.sections > MAX_SECTIONS {
        problems.push(format!("Suspicious section count: {}", h.sections));
    }
    if h.symbol_table_offset > file_size {
        problems.push("Symbol table offset beyond file size".to_string());
    }
    if h.optional_header_size > MAX_OPTIONAL_HEADER {
        problems.push(format!("Suspicious optional header size: {}", h.optional_header_size));
    }

    let report = ValidationReport {
        valid: problems.is_empty(),
        file_type: Some(file_type),
        error: (!problems.is_empty()).then(|| problems.join("; ")),
        details: BTreeMap::new(),
    };
    report
        .with_detail("magic", format!("0x{:04X}", h.magic))
        .with_detail("sections", h.sections)
        .with_detail("timestamp", h.timestamp)
        .with_detail("symbol_table_offset", h.symbol_table_offset)
        .with_detail("symbol_count", h.symbol_count)
        .with_detail("optional_header_size", h.optional_header_size)
        .with_detail("flags", format!("0x{:04X}", h.flags))
        .with_detail("file_size", file_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn xcoff32_header(sections: u16, symptr: u32, opthdr: u16) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&MAGIC_XCOFF32.to_be_bytes());
        h.extend_from_slice(&sections.to_be_bytes());
        h.extend_from_slice(&0x6500_0000u32.to_be_bytes());
        h.extend_from_slice(&symptr.to_be_bytes());
        h.extend_from_slice(&12u32.to_be_bytes());
        h.extend_from_slice(&opthdr.to_be_bytes());
        h.extend_from_slice(&0x1002u16.to_be_bytes());
        h
    }

    #[test]
    fn test_valid_xcoff32() {
        let report = inspect_header(&xcoff32_header(3, 200, 72), 4096);
        assert!(report.valid, "{:?}", report.error);
        assert_eq!(report.file_type, Some(FileType::Xcoff32));
        assert_eq!(report.details["magic"], "0x01DF");
        assert_eq!(report.details["sections"], 3);
        assert_eq!(report.details["symbol_count"], 12);
        assert_eq!(report.details["flags"], "0x1002");
    }

    #[test]
    fn test_valid_xcoff64() {
        let mut h = Vec::new();
        h.extend_from_slice(&MAGIC_XCOFF64.to_be_bytes());
        h.extend_from_slice(&4u16.to_be_bytes());
        h.extend_from_slice(&0u32.to_be_bytes());
        h.extend_from_slice(&1000u64.to_be_bytes());
        h.extend_from_slice(&120u16.to_be_bytes());
        h.extend_from_slice(&0x0002u16.to_be_bytes());
        h.extend_from_slice(&77u32.to_be_bytes());

        let report = inspect_header(&h, 8192);
        assert!(report.valid, "{:?}", report.error);
        assert_eq!(report.file_type, Some(FileType::Xcoff64));
        assert_eq!(report.details["symbol_table_offset"], 1000);
        assert_eq!(report.details["symbol_count"], 77);
    }

    #[test]
    fn test_structural_problems() {
        let report = inspect_header(&xcoff32_header(1001, 9999, 2000), 4096);
        assert!(!report.valid);
        assert_eq!(report.file_type, Some(FileType::Xcoff32));
        let error = report.error.unwrap();
        assert!(error.contains("section count"));
        assert!(error.contains("beyond file size"));
        assert!(error.contains("optional header"));
    }

    #[test]
    fn test_archives() {
        let mut h = b"<bigaf>\n".to_vec();
        h.resize(24, b' ');
        assert_eq!(inspect_header(&h, 500).file_type, Some(FileType::BigArchive));

        let mut h = b"!<arch>\n".to_vec();
        h.resize(24, 0);
        let report = inspect_header(&h, 500);
        assert!(report.valid);
        assert_eq!(report.file_type, Some(FileType::Archive));
    }

    #[test]
    fn test_too_small_and_bad_magic() {
        let report = inspect_header(&[0x01, 0xDF], 2);
        assert!(!report.valid);
        assert!(report.error.unwrap().starts_with("File too small"));

        let report = inspect_header(&[0x7f, b'E', b'L', b'F', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 4096);
        assert!(!report.valid);
        assert_eq!(report.error.as_deref(), Some("Invalid magic: 0x7F45"));
    }

    #[test]
    fn test_validate_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.o");
        let mut file = File::create(&path).unwrap();
        file.write_all(&xcoff32_header(2, 64, 0)).unwrap();
        file.write_all(&[0u8; 100]).unwrap();
        drop(file);

        assert!(validate(&path).valid);
        assert_eq!(detect_file_type(&path), FileType::Xcoff32);
        assert!(require_valid(&path).is_ok());

        let missing = dir.path().join("missing.o");
        assert!(!validate(&missing).valid);
        assert_eq!(detect_file_type(&missing), FileType::Unknown);
        assert!(matches!(require_valid(&missing), Err(Error::InvalidInput { .. })));

        assert!(!validate(dir.path()).valid);
    }
}
