//! Host file format parser.
//!
//! Parses the line-oriented override format shared by the data directory and
//! the cloud cache directory.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{CLOUD_HOSTS_FILE, HostMapping, PatternSet, USER_HOSTS_FILE, cache_index};

/// Parse a host file stream into ordered `(name, address)` pairs.
///
/// # Format
///
/// - `<address> <name>` or `<address>\t<name>`
/// - Comments start with `#`
/// - Empty lines are ignored
/// - Lines that do not split into exactly two tokens are dropped
///
/// ```text
/// # Google
/// 203.208.46.200 www.google.com
/// 203.208.46.201	mail.google.com
/// ```
pub fn parse_entries(reader: &mut dyn BufRead) -> io::Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some((address, name)) = split_entry(trimmed) {
            entries.push((name.to_string(), address.to_string()));
        }
    }

    Ok(entries)
}

/// Split a trimmed line into `(address, name)`.
fn split_entry(line: &str) -> Option<(&str, &str)> {
    let mut tokens: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.len() == 1 {
        tokens = line.split('\t').filter(|t| !t.is_empty()).collect();
    }

    match tokens.as_slice() {
        [address, name] => {
            let (address, name) = (address.trim(), name.trim());
            (!address.is_empty() && !name.is_empty()).then_some((address, name))
        }
        _ => None,
    }
}

/// Parse every host file in `dir` into a fresh mapping.
///
/// Never fails: an unreadable directory yields an empty mapping and
/// unreadable files are skipped.
pub fn parse_directory(dir: &Path, except: &PatternSet) -> HostMapping {
    let mut mapping = HostMapping::default();
    merge_directory(&mut mapping, dir, except);
    mapping
}

/// Merge every host file in `dir` into `mapping`, later entries winning.
///
/// The reserved `user_hosts.conf` and `cloud_hosts.conf` files and hidden
/// files are skipped, as is every name matching `except`. Files are visited
/// in name order with cache slots (`hosts_<i>.txt`) last, in index order.
pub fn merge_directory(mapping: &mut HostMapping, dir: &Path, except: &PatternSet) -> usize {
    let files = match list_host_files(dir) {
        Ok(files) => files,
        Err(err) => {
            tracing::debug!(dir = ?dir, error = %err, "host directory not readable");
            return 0;
        }
    };

    let mut merged = 0;
    for path in files {
        let entries = match File::open(&path).and_then(|f| parse_entries(&mut BufReader::new(f))) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = ?path, error = %err, "skipping unreadable host file");
                continue;
            }
        };

        for (name, address) in entries {
            if except.matches(&name) {
                continue;
            }
            mapping.insert(name, address);
            merged += 1;
        }
    }

    tracing::debug!(dir = ?dir, entries = merged, "merged host directory");
    merged
}

fn list_host_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == USER_HOSTS_FILE || name == CLOUD_HOSTS_FILE || name.starts_with('.') {
            continue;
        }
        files.push(entry.path());
    }

    files.sort_by_cached_key(|path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (cache_index(&name), name)
    });
    Ok(files)
}

/// Load a single host file without any exclusion, e.g. `user_hosts.conf`.
///
/// A missing file yields an empty mapping.
pub fn load_file(path: &Path) -> io::Result<HostMapping> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HostMapping::default()),
        Err(err) => return Err(err),
    };

    let entries = parse_entries(&mut BufReader::new(file))?;
    Ok(entries.into_iter().collect())
}

/// Write `mapping` in the host file format, one `address name` per line,
/// sorted by name.
pub fn write_mapping(writer: &mut dyn Write, mapping: &HostMapping) -> io::Result<()> {
    for (name, address) in mapping.iter() {
        writeln!(writer, "{address} {name}")?;
    }
    writer.flush()
}
