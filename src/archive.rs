use std::io::{Cursor, Read};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use flate2::read::GzDecoder;
use serde::Serialize;
use tar::Archive as TarArchive;
use url::Url;
use zip::ZipArchive;

use crate::error::KiraError;
use crate::fetch::Payload;

const TAR_MAGIC_OFFSET: usize = 257;
const FALLBACK_NAME: &str = "download";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Zip,
    Tar,
    Gzip,
    Plain,
}

impl PayloadKind {
    pub fn detect(content_type: Option<&str>, url: &str) -> Self {
        let essence = content_type
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase()
            })
            .unwrap_or_default();
        match essence.as_str() {
            "application/zip" | "application/x-zip-compressed" => PayloadKind::Zip,
            "application/x-tar" => PayloadKind::Tar,
            "application/gzip"
            | "application/x-gzip"
            | "application/x-tgz"
            | "application/x-compressed-tar" => PayloadKind::Gzip,
            "" | "application/octet-stream" | "binary/octet-stream" => Self::from_extension(url),
            _ => PayloadKind::Plain,
        }
    }

    fn from_extension(url: &str) -> Self {
        let name = url_basename(url).to_ascii_lowercase();
        if name.ends_with(".zip") {
            PayloadKind::Zip
        } else if name.ends_with(".tar") {
            PayloadKind::Tar
        } else if name.ends_with(".tgz") || name.ends_with(".gz") {
            PayloadKind::Gzip
        } else {
            PayloadKind::Plain
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub kind: Option<PayloadKind>,
    pub entries: Vec<ArchiveEntry>,
    pub skipped: Vec<String>,
}

pub fn expand(payload: &Payload, url: &str) -> Result<Expansion, KiraError> {
    let kind = PayloadKind::detect(payload.content_type.as_deref(), url);
    let mut expansion = match kind {
        PayloadKind::Zip => expand_zip(&payload.bytes)?,
        PayloadKind::Tar => expand_tar(&payload.bytes)?,
        PayloadKind::Gzip => expand_gzip(&payload.bytes, url, payload.last_modified)?,
        PayloadKind::Plain => Expansion {
            kind: None,
            entries: vec![ArchiveEntry {
                name: url_basename(url),
                data: payload.bytes.clone(),
                modified_at: payload.last_modified,
            }],
            skipped: Vec::new(),
        },
    };
    expansion.kind = Some(kind);
    tracing::debug!(
        ?kind,
        entries = expansion.entries.len(),
        skipped = expansion.skipped.len(),
        "expanded payload"
    );
    Ok(expansion)
}

fn expand_zip(bytes: &[u8]) -> Result<Expansion, KiraError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| KiraError::Archive(format!("zip: {err}")))?;
    let mut expansion = Expansion::default();
    for index in 0..archive.len() {
        let mut member = match archive.by_index(index) {
            Ok(member) => member,
            Err(err) => {
                expansion.skipped.push(format!("#{index}: {err}"));
                continue;
            }
        };
        let name = member.name().to_string();
        if member.is_dir() || name.ends_with('/') {
            continue;
        }
        let modified_at = member.last_modified().and_then(|stamp| {
            zip_timestamp(
                stamp.year(),
                stamp.month(),
                stamp.day(),
                stamp.hour(),
                stamp.minute(),
                stamp.second(),
            )
        });
        let mut data = Vec::new();
        match member.read_to_end(&mut data) {
            Ok(_) => expansion.entries.push(ArchiveEntry {
                name,
                data,
                modified_at,
            }),
            Err(err) => expansion.skipped.push(format!("{name}: {err}")),
        }
    }
    Ok(expansion)
}

fn zip_timestamp(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
) -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(year.into(), month.into(), day.into())?.and_hms_opt(
        hour.into(),
        minute.into(),
        second.into(),
    )?;
    Some(Utc.from_utc_datetime(&naive))
}

fn expand_tar(bytes: &[u8]) -> Result<Expansion, KiraError> {
    let mut archive = TarArchive::new(Cursor::new(bytes));
    let entries = archive
        .entries()
        .map_err(|err| KiraError::Archive(format!("tar: {err}")))?;
    let mut expansion = Expansion::default();
    for (index, entry) in entries.enumerate() {
        let mut entry = match entry {
            Ok(entry) => entry,
            // The header stream is unreadable past this point.
            Err(err) if index == 0 => return Err(KiraError::Archive(format!("tar: {err}"))),
            Err(err) => {
                expansion.skipped.push(format!("#{index}: {err}"));
                break;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = match entry.path() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(err) => {
                expansion.skipped.push(format!("#{index}: {err}"));
                continue;
            }
        };
        let modified_at = entry
            .header()
            .mtime()
            .ok()
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        let mut data = Vec::new();
        match entry.read_to_end(&mut data) {
            Ok(_) => expansion.entries.push(ArchiveEntry {
                name,
                data,
                modified_at,
            }),
            Err(err) => expansion.skipped.push(format!("{name}: {err}")),
        }
    }
    Ok(expansion)
}

fn expand_gzip(
    bytes: &[u8],
    url: &str,
    last_modified: Option<DateTime<Utc>>,
) -> Result<Expansion, KiraError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(|err| KiraError::Archive(format!("gzip: {err}")))?;
    if looks_like_tar(&data) {
        return expand_tar(&data);
    }
    Ok(Expansion {
        kind: None,
        entries: vec![ArchiveEntry {
            name: strip_gz_suffix(&url_basename(url)),
            data,
            modified_at: last_modified,
        }],
        skipped: Vec::new(),
    })
}

fn looks_like_tar(data: &[u8]) -> bool {
    data.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5) == Some(b"ustar".as_slice())
}

pub fn url_basename(url: &str) -> String {
    let segment = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string),
        Err(_) => url
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_string),
    };
    segment.unwrap_or_else(|| FALLBACK_NAME.to_string())
}

fn strip_gz_suffix(name: &str) -> String {
    if let Some(pos) = name.rfind(".gz") {
        let rest = &name[pos + 3..];
        if pos > 0 && rest.chars().all(|ch| ch.is_alphanumeric() || ch == '_') {
            return name[..pos].to_string();
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;
    use crate::domain::Validators;

    fn payload(bytes: Vec<u8>, content_type: Option<&str>) -> Payload {
        Payload {
            bytes,
            content_type: content_type.map(str::to_string),
            last_modified: None,
            validators: Validators::default(),
        }
    }

    fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn detects_kind_from_content_type_and_extension() {
        assert_eq!(
            PayloadKind::detect(Some("application/zip"), "https://x/y"),
            PayloadKind::Zip
        );
        assert_eq!(
            PayloadKind::detect(Some("application/x-gzip; charset=binary"), "https://x/y"),
            PayloadKind::Gzip
        );
        assert_eq!(
            PayloadKind::detect(Some("application/octet-stream"), "https://x/db.tar"),
            PayloadKind::Tar
        );
        assert_eq!(
            PayloadKind::detect(Some("text/plain"), "https://x/db.zip"),
            PayloadKind::Plain
        );
    }

    #[test]
    fn plain_payload_is_named_after_url() {
        let expansion = expand(
            &payload(b"hello".to_vec(), Some("text/plain")),
            "https://example.org/pub/readme.txt?download=1",
        )
        .unwrap();
        assert_eq!(expansion.entries.len(), 1);
        assert_eq!(expansion.entries[0].name, "readme.txt");
    }

    #[test]
    fn tar_members_become_entries() {
        let bytes = tar_bytes(&[("a.txt", b"alpha"), ("dir/b.txt", b"beta")]);
        let expansion = expand(
            &payload(bytes, Some("application/x-tar")),
            "https://example.org/bundle.tar",
        )
        .unwrap();
        let names = expansion
            .entries
            .iter()
            .map(|entry| entry.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.txt", "dir/b.txt"]);
        assert!(expansion.entries[0].modified_at.is_some());
    }

    #[test]
    fn gzip_member_drops_suffix() {
        let expansion = expand(
            &payload(gzip(b"ACGT"), Some("application/gzip")),
            "https://example.org/genome.fa.gz",
        )
        .unwrap();
        assert_eq!(expansion.entries[0].name, "genome.fa");
        assert_eq!(expansion.entries[0].data, b"ACGT");
    }

    #[test]
    fn gzip_holding_tar_is_expanded_as_tar() {
        let bytes = gzip(&tar_bytes(&[("inner.tsv", b"x\ty\n")]));
        let expansion = expand(
            &payload(bytes, Some("application/gzip")),
            "https://example.org/dump.tar.gz",
        )
        .unwrap();
        assert_eq!(expansion.entries.len(), 1);
        assert_eq!(expansion.entries[0].name, "inner.tsv");
    }

    #[test]
    fn corrupt_container_is_an_archive_error() {
        let err = expand(
            &payload(b"definitely not a zip".to_vec(), Some("application/zip")),
            "https://example.org/a.zip",
        )
        .unwrap_err();
        assert_matches!(err, KiraError::Archive(_));
    }

    #[test]
    fn gz_suffix_rules() {
        assert_eq!(strip_gz_suffix("a.fa.gz"), "a.fa");
        assert_eq!(strip_gz_suffix("a.gzip"), "a");
        assert_eq!(strip_gz_suffix("a.gz.bak"), "a.gz.bak");
        assert_eq!(strip_gz_suffix(".gz"), ".gz");
    }

    #[test]
    fn basename_falls_back_for_bare_hosts() {
        assert_eq!(url_basename("https://example.org/"), FALLBACK_NAME);
        assert_eq!(url_basename("https://example.org/a/b/"), "b");
    }
}
