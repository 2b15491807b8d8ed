use std::path::MAIN_SEPARATOR;

use crate::{StorageError, StorageResult};

/// First pathname of every multi-file swarm; doubles as the in-band marker
/// that distinguishes a multi-file spec from single-file content.
pub const MULTIFILE_PATHNAME: &str = "META-INF-multifilespec.txt";
/// Portable separator used by spec pathnames, independent of the host.
pub const SPEC_PATH_SEP: char = '/';
/// Upper bound on one spec line, path and size included.
pub const MULTIFILE_MAX_LINE: usize = 1024;

/// One parsed line of the multi-file spec: a portable pathname and the
/// declared byte size of that entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub spec_path: String,
    pub size: u64,
}

/// True when `buf` opens with the multi-file spec marker.
pub fn starts_with_marker(buf: &[u8]) -> bool {
    let marker = MULTIFILE_PATHNAME.as_bytes();
    buf.len() >= marker.len() && &buf[..marker.len()] == marker
}

/// Parse the declared spec size out of the first chunk of a multi-file
/// swarm. The chunk opens with `"META-INF-multifilespec.txt <decimal>"`;
/// the decimal is the byte size of the whole spec file.
pub fn parse_header(buf: &[u8]) -> StorageResult<u64> {
    let marker = MULTIFILE_PATHNAME.as_bytes();
    if !starts_with_marker(buf) {
        return Err(StorageError::InvalidParam(
            "chunk does not open with the multifile marker".to_string(),
        ));
    }
    let rest = &buf[marker.len()..];
    if rest.first() != Some(&b' ') {
        return Err(StorageError::InvalidParam(
            "multifile marker not followed by a space".to_string(),
        ));
    }
    let digits: Vec<u8> = rest[1..]
        .iter()
        .copied()
        .take_while(|b| b.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Err(StorageError::InvalidParam(
            "multifile spec size missing".to_string(),
        ));
    }
    let text = std::str::from_utf8(&digits)
        .map_err(|e| StorageError::InvalidData(e.to_string()))?;
    text.parse::<u64>()
        .map_err(|e| StorageError::InvalidData(format!("bad spec size: {}", e)))
}

/// Parse the full multi-file spec. Lines are UTF-8, `\n`-terminated, at most
/// `MULTIFILE_MAX_LINE` bytes. The whole spec is validated before the caller
/// creates any entry file, so a malformed or unsafe line leaves no partial
/// file set on disk.
pub fn parse_entries(data: &[u8]) -> StorageResult<Vec<ManifestEntry>> {
    let text = std::str::from_utf8(data)
        .map_err(|e| StorageError::InvalidData(format!("spec is not UTF-8: {}", e)))?;

    let mut entries = Vec::new();
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    for line in lines {
        if line.len() > MULTIFILE_MAX_LINE {
            return Err(StorageError::InvalidData(format!(
                "spec line longer than {} bytes",
                MULTIFILE_MAX_LINE
            )));
        }
        entries.push(parse_line(line)?);
    }
    Ok(entries)
}

fn parse_line(line: &str) -> StorageResult<ManifestEntry> {
    // The separator is the LAST space: pathnames may contain spaces.
    let idx = line
        .rfind(' ')
        .ok_or_else(|| StorageError::InvalidData(format!("spec line without size: {:?}", line)))?;
    let spec_path = &line[..idx];
    let size = line[idx + 1..]
        .trim_end()
        .parse::<u64>()
        .map_err(|e| StorageError::InvalidData(format!("bad entry size in {:?}: {}", line, e)))?;

    check_path_safety(spec_path)?;

    Ok(ManifestEntry {
        spec_path: spec_path.to_string(),
        size,
    })
}

/// Reject pathnames that could escape the destination directory: absolute
/// paths and anything containing the literal `..`.
pub fn check_path_safety(spec_path: &str) -> StorageResult<()> {
    if spec_path.starts_with(SPEC_PATH_SEP) {
        return Err(StorageError::InvalidData(format!(
            "entry path must not be absolute: {:?}",
            spec_path
        )));
    }
    if spec_path.contains("..") {
        return Err(StorageError::InvalidData(format!(
            "entry path must not contain '..': {:?}",
            spec_path
        )));
    }
    Ok(())
}

/// Translate a portable spec pathname to host syntax. UTF-8 to OS encoding
/// is left to the host I/O layer.
pub fn spec_to_os_path(spec_path: &str) -> String {
    if MAIN_SEPARATOR == SPEC_PATH_SEP {
        spec_path.to_string()
    } else {
        spec_path.replace(SPEC_PATH_SEP, &MAIN_SEPARATOR.to_string())
    }
}

/// Inverse of [`spec_to_os_path`].
pub fn os_to_spec_path(os_path: &str) -> String {
    if MAIN_SEPARATOR == SPEC_PATH_SEP {
        os_path.to_string()
    } else {
        os_path.replace(MAIN_SEPARATOR, &SPEC_PATH_SEP.to_string())
    }
}
