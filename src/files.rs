//! Filesystem helpers used by settings, schema, logger and the update cycle.
//!
//! All functions are blocking; async callers run the heavy ones (extraction,
//! directory copy) through `tokio::task::spawn_blocking`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::{GzDecoder, ZlibDecoder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tar::{Archive, EntryType};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{PepeunitError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Reads a JSON document, unwrapping one level of JSON-in-a-string encoding.
pub fn read_json_value(path: &Path) -> Result<Value> {
    let data = fs::read(path).map_err(|e| PepeunitError::io(path, e))?;
    let value: Value = serde_json::from_slice(&data).map_err(|e| PepeunitError::json(path, e))?;
    match value {
        Value::String(inner) => {
            serde_json::from_str(&inner).map_err(|e| PepeunitError::json(path, e))
        }
        other => Ok(other),
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let value = read_json_value(path)?;
    serde_json::from_value(value).map_err(|e| PepeunitError::json(path, e))
}

/// Writes `value` as indented JSON through a temp file in the same directory,
/// so readers see either the old or the new document.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .map_err(|e| PepeunitError::json(path, e))?;
    buf.push(b'\n');
    write_atomic(path, &buf)
}

pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| PepeunitError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PepeunitError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| PepeunitError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| PepeunitError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| PepeunitError::io(path, e.error))?;
    Ok(())
}

pub fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(dir) = dest.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|e| PepeunitError::io(dir, e))?;
        }
    }
    fs::copy(src, dest).map_err(|e| PepeunitError::io(src, e))?;
    Ok(())
}

/// Copies everything below `src` into `dest`, creating directories as needed
/// and overwriting files that already exist.
pub fn copy_dir_contents(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| PepeunitError::io(dest, e))?;
    for entry in fs::read_dir(src).map_err(|e| PepeunitError::io(src, e))? {
        let entry = entry.map_err(|e| PepeunitError::io(src, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| PepeunitError::io(&from, e))?;
        if file_type.is_dir() {
            copy_dir_contents(&from, &to)?;
        } else {
            copy_file(&from, &to)?;
        }
    }
    Ok(())
}

/// Depth-first search for a regular file called `name` below `root`.
/// Shallower matches win; siblings are visited in name order.
pub fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    let mut entries: Vec<_> = fs::read_dir(root).ok()?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => dirs.push(path),
            Ok(t) if t.is_file() && entry.file_name() == name => return Some(path),
            _ => {}
        }
    }
    dirs.iter().find_map(|dir| find_file(dir, name))
}

/// Extracts a tar archive compressed with gzip or zlib (detected from the
/// header) into `dest`. Entries that would land outside `dest` are skipped.
pub fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| PepeunitError::io(archive_path, e))?;
    let mut reader = BufReader::new(file);
    let header = reader
        .fill_buf()
        .map_err(|e| PepeunitError::io(archive_path, e))?;
    let is_gzip = header.len() >= 2 && header[..2] == GZIP_MAGIC;

    let decoder: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(ZlibDecoder::new(reader))
    };

    fs::create_dir_all(dest).map_err(|e| PepeunitError::io(dest, e))?;
    let mut archive = Archive::new(decoder);
    let entries = archive
        .entries()
        .map_err(|e| PepeunitError::io(archive_path, e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| PepeunitError::io(archive_path, e))?;
        let entry_path = entry
            .path()
            .map_err(|e| PepeunitError::io(archive_path, e))?
            .into_owned();

        if entry_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            warn!("Skipping archive entry outside destination: {:?}", entry_path);
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Directory | EntryType::Regular | EntryType::Continuous => {
                entry
                    .unpack_in(dest)
                    .map_err(|e| PepeunitError::io(dest.join(&entry_path), e))?;
            }
            // pax/gnu metadata records carry no content of their own
            EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName => {}
            other => {
                return Err(PepeunitError::io(
                    &entry_path,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unsupported archive entry type {:?}", other),
                    ),
                ));
            }
        }
    }

    debug!("Extracted {:?} into {:?}", archive_path, dest);
    Ok(())
}

/// Appends one JSON object per line and keeps at most `max_lines` lines.
pub fn append_ndjson(path: &Path, item: &Value, max_lines: usize) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| PepeunitError::io(dir, e))?;

    let mut line = serde_json::to_vec(item).map_err(|e| PepeunitError::json(path, e))?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PepeunitError::io(path, e))?;
    file.write_all(&line).map_err(|e| PepeunitError::io(path, e))?;
    drop(file);

    if max_lines > 0 {
        trim_ndjson(path, max_lines)?;
    }
    Ok(())
}

fn trim_ndjson(path: &Path, max_lines: usize) -> Result<()> {
    let content = fs::read_to_string(path).map_err(|e| PepeunitError::io(path, e))?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() <= max_lines {
        return Ok(());
    }

    let mut kept = lines[lines.len() - max_lines..].join("\n");
    kept.push('\n');
    write_atomic(path, kept.as_bytes())
}

/// Reads every parseable JSON line; a missing file reads as empty.
pub fn read_ndjson(path: &Path) -> Vec<Value> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    BufReader::new(file)
        .lines()
        .map_while(|line| line.ok())
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(&line).ok())
        .collect()
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Packs `src_dir` into a gzip tarball; test fixture for the update cycle.
#[cfg(test)]
pub(crate) fn create_tar_gz(src_dir: &Path, archive_path: &Path) -> Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let file = File::create(archive_path).map_err(|e| PepeunitError::io(archive_path, e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", src_dir)
        .map_err(|e| PepeunitError::io(src_dir, e))?;
    builder
        .into_inner()
        .and_then(|enc| enc.finish())
        .map_err(|e| PepeunitError::io(archive_path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_string_documents_are_unwrapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.json");
        fs::write(&path, r#""{\"PU_DOMAIN\": \"example.com\"}""#).unwrap();

        let value = read_json_value(&path).unwrap();
        assert_eq!(value, json!({"PU_DOMAIN": "example.com"}));
    }

    #[test]
    fn write_json_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        write_json(&path, &json!({"a": 1})).unwrap();
        write_json(&path, &json!({"a": 2})).unwrap();

        assert_eq!(read_json_value(&path).unwrap(), json!({"a": 2}));
    }

    #[test]
    fn extract_roundtrips_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("env.json"), "{}").unwrap();
        fs::write(src.join("nested/app.txt"), "payload").unwrap();

        let archive = dir.path().join("update.tgz");
        create_tar_gz(&src, &archive).unwrap();

        let out = dir.path().join("out");
        extract_tar_gz(&archive, &out).unwrap();
        assert_eq!(
            fs::read_to_string(out.join("nested/app.txt")).unwrap(),
            "payload"
        );
        assert!(out.join("env.json").exists());
    }

    #[test]
    fn extract_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.tgz");
        fs::write(&archive, b"definitely not an archive").unwrap();

        assert!(extract_tar_gz(&archive, &dir.path().join("out")).is_err());
    }

    #[test]
    fn copy_dir_contents_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(src.join("lib/mod.txt"), "new").unwrap();
        fs::write(dest.join("keep.txt"), "keep").unwrap();

        copy_dir_contents(&src, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("lib/mod.txt")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dest.join("keep.txt")).unwrap(), "keep");
    }

    #[test]
    fn ndjson_is_trimmed_to_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        for i in 0..5 {
            append_ndjson(&path, &json!({"n": i}), 3).unwrap();
        }

        let entries = read_ndjson(&path);
        assert_eq!(entries, vec![json!({"n": 2}), json!({"n": 3}), json!({"n": 4})]);
    }

    #[test]
    fn missing_ndjson_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_ndjson(&dir.path().join("nope.json")).is_empty());
    }

    #[test]
    fn find_file_prefers_shallow_matches() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/deep")).unwrap();
        fs::write(dir.path().join("a/deep/env.json"), "{}").unwrap();
        assert_eq!(
            find_file(dir.path(), "env.json"),
            Some(dir.path().join("a/deep/env.json"))
        );

        fs::write(dir.path().join("env.json"), "{}").unwrap();
        assert_eq!(
            find_file(dir.path(), "env.json"),
            Some(dir.path().join("env.json"))
        );
        assert_eq!(find_file(dir.path(), "schema.json"), None);
    }
}
