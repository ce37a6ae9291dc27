//! Deterministic archive assembly.
//!
//! The bundle is a gzip-compressed tar with file entries only. Every header
//! uses mode 0644, uid/gid 0, and the run start as mtime, and the gzip header
//! carries mtime 0, so identical inputs give byte-identical output apart from
//! the run timestamp.
//!
//! Entry order: cluster-level entries (manifest, namespace resource dumps,
//! certificate secrets) sorted by path, then instances sorted by id, each in
//! category order logs, state files, summary.

use crate::error::CollectorError;
use crate::models::{ArchiveEntry, CollectionResult, FileContent, RunManifest};
use crate::Result;
use flate2::{Compression, GzBuilder};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Top-level directory inside the archive.
pub const ROOT_DIR: &str = "cluster-dump";

/// Run manifest file name.
pub const MANIFEST_FILE: &str = "metadata.json";

/// Summary report file name inside an instance directory.
pub const SUMMARY_FILE: &str = "summary.txt";

/// A namespace resource dump entry, e.g. `cluster-dump/db/pods.yaml`.
pub fn namespace_entry(namespace: &str, resource: &str, content: Vec<u8>) -> ArchiveEntry {
    ArchiveEntry {
        path: format!("{}/{}/{}.yaml", ROOT_DIR, namespace, resource),
        content,
        source: None,
    }
}

/// Builds the archive for one run.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveBuilder {
    mtime: u64,
}

impl ArchiveBuilder {
    /// `run_started` becomes the mtime of every entry.
    pub fn new(run_started: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            mtime: u64::try_from(run_started.timestamp()).unwrap_or(0),
        }
    }

    /// Lays out all entries in archive order.
    ///
    /// Certificate secrets are namespace-scoped: the same secret seen from
    /// several instances is emitted once. Absent files are listed in the
    /// manifest only. A path that has already been emitted is skipped.
    pub fn entries(
        &self,
        manifest: &RunManifest,
        results: &[CollectionResult],
        cluster_entries: Vec<ArchiveEntry>,
    ) -> Result<Vec<ArchiveEntry>> {
        let manifest_json =
            serde_json::to_vec_pretty(manifest).map_err(|source| CollectorError::Serialization {
                context: "run manifest".to_string(),
                source,
            })?;

        let mut ordered: Vec<&CollectionResult> = results.iter().collect();
        ordered.sort_by(|a, b| a.instance.cmp(&b.instance));

        let mut cluster_level: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        cluster_level.insert(format!("{}/{}", ROOT_DIR, MANIFEST_FILE), manifest_json);
        for entry in cluster_entries {
            cluster_level.entry(entry.path).or_insert(entry.content);
        }
        for result in &ordered {
            for cert in &result.certificates {
                let path = format!(
                    "{}/{}/{}",
                    ROOT_DIR, result.instance.namespace, cert.record.name
                );
                cluster_level
                    .entry(path)
                    .or_insert_with(|| cert.text.clone().into_bytes());
            }
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (path, content) in cluster_level {
            seen.insert(path.clone());
            entries.push(ArchiveEntry {
                path,
                content,
                source: None,
            });
        }

        for result in ordered {
            let base = format!(
                "{}/{}/{}",
                ROOT_DIR, result.instance.namespace, result.instance.pod
            );

            let mut files: Vec<_> = result.files.iter().collect();
            files.sort_by(|a, b| (a.category, &a.path).cmp(&(b.category, &b.path)));

            let instance_entries = files
                .into_iter()
                .filter_map(|f| match &f.content {
                    FileContent::Present(bytes) => Some((f.path.as_str(), bytes.clone())),
                    FileContent::Absent => None,
                })
                .chain(std::iter::once((SUMMARY_FILE, result.summary.render())));

            for (relative, content) in instance_entries {
                let path = format!("{}/{}", base, relative);
                if !seen.insert(path.clone()) {
                    tracing::warn!("Skipping duplicate archive path {}", path);
                    continue;
                }
                entries.push(ArchiveEntry {
                    path,
                    content,
                    source: Some(result.instance.clone()),
                });
            }
        }

        Ok(entries)
    }

    /// Lays out and encodes the archive in memory.
    pub fn build(
        &self,
        manifest: &RunManifest,
        results: &[CollectionResult],
        cluster_entries: Vec<ArchiveEntry>,
    ) -> Result<Vec<u8>> {
        let entries = self.entries(manifest, results, cluster_entries)?;
        self.encode(&entries)
    }

    /// Encodes entries, in the given order, as a gzip-compressed tar.
    pub fn encode(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
        let encoder = GzBuilder::new()
            .mtime(0)
            .write(Vec::new(), Compression::default());
        let mut tar = tar::Builder::new(encoder);

        for entry in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(entry.content.len() as u64);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(self.mtime);
            tar.append_data(&mut header, &entry.path, entry.content.as_slice())
                .map_err(|e| CollectorError::archive(format!("adding {}", entry.path), e))?;
        }

        let encoder = tar
            .into_inner()
            .map_err(|e| CollectorError::archive("finishing tar stream", e))?;
        encoder
            .finish()
            .map_err(|e| CollectorError::archive("finishing gzip stream", e))
    }
}

/// Publishes `bytes` at `path` atomically.
///
/// The data is written to a temporary file in the destination directory,
/// synced, and renamed into place. On failure no file is left at `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let context = format!("writing {}", path.display());

    let mut tmp =
        NamedTempFile::new_in(dir).map_err(|e| CollectorError::archive(context.clone(), e))?;
    tmp.write_all(bytes)
        .map_err(|e| CollectorError::archive(context.clone(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CollectorError::archive(context.clone(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .map_err(|e| CollectorError::archive(context.clone(), e))?;
    }

    tmp.persist(path)
        .map_err(|e| CollectorError::archive(context, e.error))?;
    tracing::info!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DecodedSecret, EngineKind, EngineSelection, EntryCategory, FileEntry, InstanceId,
        SecretRecord, SecretRole, SummaryOutcome,
    };
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::io::Read;

    fn started() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn result(pod: &str, summary_ok: bool) -> CollectionResult {
        let mut r = CollectionResult::new(InstanceId::new("db", pod), "cluster1");
        r.files.push(FileEntry::present(
            EntryCategory::State,
            "var/lib/mysql/grastate.dat",
            b"# GALERA saved state\n".to_vec(),
        ));
        r.files.push(FileEntry::absent(EntryCategory::State, "var/lib/mysql/gvwstate.dat"));
        r.files.push(FileEntry::present(EntryCategory::Logs, "logs.txt", b"log\n".to_vec()));
        r.certificates.push(DecodedSecret {
            record: SecretRecord {
                name: "cluster1-ssl".to_string(),
                role: SecretRole::Leaf,
            },
            text: "ca.crt:\nCertificate:\n".to_string(),
        });
        r.summary = if summary_ok {
            SummaryOutcome::Success {
                output: b"report\n".to_vec(),
            }
        } else {
            SummaryOutcome::failure("exit status 1")
        };
        r
    }

    fn manifest(results: &[CollectionResult]) -> RunManifest {
        RunManifest::new(EngineSelection::Auto, EngineKind::Pxc, started()).with_results(results)
    }

    fn unpack(bytes: &[u8]) -> Vec<(String, tar::EntryType, u32, u64, Vec<u8>)> {
        let decoder = flate2::read::GzDecoder::new(bytes);
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let path = e.path().unwrap().to_string_lossy().into_owned();
                let kind = e.header().entry_type();
                let mode = e.header().mode().unwrap();
                let mtime = e.header().mtime().unwrap();
                let mut content = Vec::new();
                e.read_to_end(&mut content).unwrap();
                (path, kind, mode, mtime, content)
            })
            .collect()
    }

    #[test]
    fn test_entry_order_and_dedup() {
        let results = vec![result("cluster1-pxc-1", true), result("cluster1-pxc-0", false)];
        let builder = ArchiveBuilder::new(started());
        let cluster = vec![namespace_entry("db", "pods", b"kind: List\n".to_vec())];
        let entries = builder.entries(&manifest(&results), &results, cluster).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();

        assert_eq!(
            paths,
            vec![
                "cluster-dump/db/cluster1-ssl",
                "cluster-dump/db/pods.yaml",
                "cluster-dump/metadata.json",
                "cluster-dump/db/cluster1-pxc-0/logs.txt",
                "cluster-dump/db/cluster1-pxc-0/var/lib/mysql/grastate.dat",
                "cluster-dump/db/cluster1-pxc-0/summary.txt",
                "cluster-dump/db/cluster1-pxc-1/logs.txt",
                "cluster-dump/db/cluster1-pxc-1/var/lib/mysql/grastate.dat",
                "cluster-dump/db/cluster1-pxc-1/summary.txt",
            ]
        );
        assert!(entries[..3].iter().all(|e| e.source.is_none()));
        assert_eq!(
            entries[3].source,
            Some(InstanceId::new("db", "cluster1-pxc-0"))
        );
    }

    #[test]
    fn test_headers_are_normalized() {
        let results = vec![result("cluster1-pxc-0", true)];
        let bytes = ArchiveBuilder::new(started())
            .build(&manifest(&results), &results, Vec::new())
            .unwrap();

        let unpacked = unpack(&bytes);
        assert!(!unpacked.is_empty());
        for (path, kind, mode, mtime, _) in &unpacked {
            assert_eq!(*kind, tar::EntryType::Regular, "{}", path);
            assert_eq!(*mode, 0o644);
            assert_eq!(*mtime, started().timestamp() as u64);
        }
        // gzip MTIME field
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_failed_summary_carries_marker() {
        let results = vec![result("cluster1-pxc-0", false)];
        let bytes = ArchiveBuilder::new(started())
            .build(&manifest(&results), &results, Vec::new())
            .unwrap();
        let summary = unpack(&bytes)
            .into_iter()
            .find(|(p, ..)| p.ends_with("summary.txt"))
            .unwrap();
        assert_eq!(summary.4, b"stderr: exit status 1\n");
    }

    #[test]
    fn test_build_is_deterministic() {
        let results = vec![result("cluster1-pxc-0", true), result("cluster1-pxc-1", true)];
        let reversed: Vec<_> = results.iter().rev().cloned().collect();
        let builder = ArchiveBuilder::new(started());

        let a = builder.build(&manifest(&results), &results, Vec::new()).unwrap();
        let b = builder.build(&manifest(&reversed), &reversed, Vec::new()).unwrap();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn prop_entries_ignore_completion_order(order in Just((0..6).collect::<Vec<usize>>()).prop_shuffle()) {
            let results: Vec<CollectionResult> = (0..6)
                .map(|i| result(&format!("cluster1-pxc-{}", i), i % 2 == 0))
                .collect();
            let shuffled: Vec<CollectionResult> =
                order.iter().map(|&i| results[i].clone()).collect();
            let builder = ArchiveBuilder::new(started());

            let expected = builder.entries(&manifest(&results), &results, Vec::new()).unwrap();
            let actual = builder.entries(&manifest(&shuffled), &shuffled, Vec::new()).unwrap();
            prop_assert_eq!(expected, actual);
        }
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster-dump.tar.gz");
        write_atomic(&path, b"data").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        write_atomic(&path, b"newer").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"newer");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_atomic_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.tar.gz");
        let err = write_atomic(&path, b"data").unwrap_err();
        assert!(matches!(err, CollectorError::Archive { .. }));
        assert!(!path.exists());
    }
}
