//! Local output naming: sanitize suggested names and reserve a unique file.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

const MAX_NUMBERED_ATTEMPTS: u32 = 999;

/// Reduce a suggested name to a single safe path component, falling back to
/// the device file's base name.
pub fn sanitize_name(suggested: &str, source_path: &str) -> String {
    let clean = |name: &str| -> String {
        let name: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
            .collect();
        let name = name.trim();
        if name.is_empty() || name == "." || name == ".." {
            String::new()
        } else {
            name.to_string()
        }
    };

    let name = clean(suggested);
    if !name.is_empty() {
        return name;
    }

    let base = source_path.rsplit('/').find(|p| !p.is_empty()).unwrap_or_default();
    let name = clean(base);
    if name.is_empty() { "export".to_string() } else { name }
}

/// Create `dir/name`, or `name (1).ext`, `name (2).ext`, ... if taken, and
/// finally a timestamped name. Never overwrites an existing file.
pub fn create_unique(dir: &Path, name: &str) -> io::Result<(PathBuf, File)> {
    let first = dir.join(name);
    if let Some(file) = try_create(&first)? {
        return Ok((first, file));
    }

    let (stem, extension) = split_name(name);

    for counter in 1..=MAX_NUMBERED_ATTEMPTS {
        let candidate = dir.join(with_suffix(stem, extension, &format!(" ({})", counter)));
        if let Some(file) = try_create(&candidate)? {
            return Ok((candidate, file));
        }
    }

    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f").to_string();
    let candidate = dir.join(with_suffix(stem, extension, &format!(" {}", stamp)));
    match try_create(&candidate)? {
        Some(file) => Ok((candidate, file)),
        None => Err(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free output name for {}", name),
        )),
    }
}

fn try_create(path: &Path) -> io::Result<Option<File>> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e),
    }
}

/// Split at the last dot, keeping dotfiles like `.profile` whole.
fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(i) => (&name[..i], Some(&name[i + 1..])),
    }
}

fn with_suffix(stem: &str, extension: Option<&str>, suffix: &str) -> String {
    match extension {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext),
        None => format!("{}{}", stem, suffix),
    }
}
