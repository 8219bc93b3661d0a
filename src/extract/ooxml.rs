//! Shared helpers for the zip-packaged office formats.

use std::io::{Cursor, Read};

use bytes::Bytes;
use regex::Regex;
use tracing::warn;
use zip::ZipArchive;
use zip::result::ZipError;

use super::ExtractContext;
use crate::storage::sanitize_object_name;

pub(crate) type Archive = ZipArchive<Cursor<Bytes>>;

pub(crate) fn open(data: &Bytes) -> Result<Archive, ZipError> {
    ZipArchive::new(Cursor::new(data.clone()))
}

pub(crate) fn read_entry(archive: &mut Archive, name: &str) -> Result<String, ZipError> {
    let mut entry = archive.by_name(name)?;
    let mut out = String::new();
    entry.read_to_string(&mut out)?;
    Ok(out)
}

/// Entry names, in archive order.
pub(crate) fn entry_names(archive: &Archive) -> Vec<String> {
    archive.file_names().map(str::to_string).collect()
}

#[derive(Debug)]
pub(crate) struct MediaEntry {
    pub name: String,
    pub media_type: String,
    pub data: Bytes,
}

/// Reads every file under `prefix` (e.g. `word/media/`). Unreadable entries
/// are skipped with a warning.
pub(crate) fn media_entries(archive: &mut Archive, prefix: &str) -> Vec<MediaEntry> {
    let names: Vec<String> = entry_names(archive)
        .into_iter()
        .filter(|name| name.starts_with(prefix) && !name.ends_with('/'))
        .collect();

    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let mut buf = Vec::new();
        let read = archive
            .by_name(&name)
            .map_err(std::io::Error::other)
            .and_then(|mut entry| entry.read_to_end(&mut buf));
        match read {
            Ok(_) => out.push(MediaEntry {
                media_type: image_type_for(&name).to_string(),
                name,
                data: Bytes::from(buf),
            }),
            Err(err) => warn!(entry = %name, error = %err, "skipping unreadable media entry"),
        }
    }
    out
}

fn image_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        "emf" => "image/emf",
        "wmf" => "image/wmf",
        _ => "application/octet-stream",
    }
}

/// Uploads embedded media and returns the stored URLs. A failed upload only
/// drops that image.
pub(crate) async fn upload_media(
    source_name: &str,
    entries: Vec<MediaEntry>,
    cx: &ExtractContext,
) -> Vec<String> {
    let stem = sanitize_object_name(source_name);
    let mut urls = Vec::with_capacity(entries.len());
    for entry in entries {
        let file = entry.name.rsplit('/').next().unwrap_or(&entry.name);
        let object_name = format!("{stem}-{file}");
        match cx.store.put(&object_name, entry.data, &entry.media_type).await {
            Ok(url) => urls.push(url),
            Err(err) => {
                warn!(source = %source_name, entry = %entry.name, error = %err, "embedded image upload failed")
            }
        }
    }
    urls
}

/// Concatenates the text runs matched by capture group 1 of `runs`. A match
/// without that group is a paragraph end and becomes a newline.
pub(crate) fn collect_runs(xml: &str, runs: &Regex) -> String {
    let mut out = String::new();
    for captures in runs.captures_iter(xml) {
        match captures.get(1) {
            Some(run) => out.push_str(&unescape_xml(run.as_str())),
            None => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }
    out.trim_end().to_string()
}

pub(crate) fn unescape_xml(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
