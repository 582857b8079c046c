//! Export of policy targets and packaging into a single archive file.
//!
//! Layout: `data/<target>.jsonl` per exported target plus a `manifest.json`
//! summarising the export, gzip-compressed tar.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::job::TargetExport;
use crate::services::encryption::{self, ENCRYPTED_SUFFIX};
use crate::store::DataExporter;

pub const MANIFEST_MEMBER: &str = "manifest.json";
const DATA_DIR: &str = "data";

/// A finished archive on local disk.
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub checksum_sha256: String,
    pub encrypted: bool,
    /// Member paths inside the tarball.
    pub files: Vec<String>,
}

/// `backup-YYYYMMDD-HHMMSS-<short id>.tar.gz[.enc]`
pub fn archive_name(job_id: Uuid, at: DateTime<Utc>, encrypted: bool) -> String {
    let short = job_id.simple().to_string();
    format!(
        "backup-{}-{}.tar.gz{}",
        at.format("%Y%m%d-%H%M%S"),
        &short[..8],
        if encrypted { ENCRYPTED_SUFFIX } else { "" }
    )
}

fn sanitized_stem(target: &str) -> String {
    target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `<sanitized target>.jsonl`, suffixed with `-2`, `-3`, ... when another
/// target of the same archive already sanitized to that name.
fn unique_member_file_name(target: &str, taken: &mut HashSet<String>) -> String {
    let stem = sanitized_stem(target);
    let mut candidate = format!("{}.jsonl", stem);
    let mut n = 2;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{}-{}.jsonl", stem, n);
        n += 1;
    }
    candidate
}

/// Export every target into `work_dir/data`. Unknown targets are recorded
/// with zero rows and no file.
pub async fn export_targets(
    exporter: &dyn DataExporter,
    targets: &[String],
    work_dir: &Path,
) -> Result<Vec<TargetExport>> {
    let data_dir = work_dir.join(DATA_DIR);
    tokio::fs::create_dir_all(&data_dir).await?;

    let mut exports = Vec::with_capacity(targets.len());
    let mut taken = HashSet::new();
    for target in targets {
        let file_name = unique_member_file_name(target, &mut taken);
        let out = data_dir.join(&file_name);
        match exporter.export(target, &out).await? {
            Some(rows) => exports.push(TargetExport {
                name: target.clone(),
                rows,
                file: Some(format!("{}/{}", DATA_DIR, file_name)),
            }),
            None => {
                tracing::debug!(target_name = %target, "Export target has no data source");
                exports.push(TargetExport {
                    name: target.clone(),
                    rows: 0,
                    file: None,
                });
            }
        }
    }
    Ok(exports)
}

/// Package the exported files of `work_dir` into an archive, optionally
/// encrypting it.
pub async fn create_archive(
    work_dir: &Path,
    job_id: Uuid,
    started_at: DateTime<Utc>,
    exports: &[TargetExport],
    encrypt: bool,
    passphrase: Option<&str>,
) -> Result<BuiltArchive> {
    let plain_name = archive_name(job_id, started_at, false);
    let plain_path = work_dir.join(&plain_name);

    let summary = json!({
        "job_id": job_id,
        "created_at": started_at,
        "targets": exports,
    });
    let summary = serde_json::to_vec_pretty(&summary)?;

    let members: Vec<(PathBuf, String)> = exports
        .iter()
        .filter_map(|e| e.file.as_ref().map(|f| (work_dir.join(f), f.clone())))
        .collect();

    let out = plain_path.clone();
    let files = tokio::task::spawn_blocking(move || write_tarball(&out, &members, &summary))
        .await
        .map_err(|e| AppError::Internal(format!("archive task failed: {}", e)))??;

    let (path, name) = if encrypt {
        let path = encryption::encrypt_file(&plain_path, passphrase).await?;
        (path, archive_name(job_id, started_at, true))
    } else {
        (plain_path, plain_name)
    };

    let size = tokio::fs::metadata(&path).await?.len();
    let checksum_sha256 = sha256_file(&path).await?;

    Ok(BuiltArchive {
        path,
        name,
        size,
        checksum_sha256,
        encrypted: encrypt,
        files,
    })
}

fn write_tarball(out: &Path, members: &[(PathBuf, String)], summary: &[u8]) -> Result<Vec<String>> {
    let file = File::create(out)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut files = Vec::with_capacity(members.len() + 1);
    for (source, member) in members {
        builder.append_path_with_name(source, member)?;
        files.push(member.clone());
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(summary.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, MANIFEST_MEMBER, summary)?;
    files.push(MANIFEST_MEMBER.to_string());

    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()?;
    Ok(files)
}

/// Hex SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
