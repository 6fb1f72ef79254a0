//! Assembling, hashing and signing policy bundles.
//!
//! A bundle is a content-addressed snapshot of the policy source tree,
//! filtered by scope.  Two builds over identical inputs produce identical
//! hashes; the version string only records *when* the bundle was cut.  The
//! artifact store is keyed by hash, so rebuilding unchanged content simply
//! re-points at the existing artifact.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Write};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use flate2::Compression;
use jiff::civil::Date;
use jiff::Timestamp;
use rayon::prelude::*;
use ring::digest;
use ring::signature::Ed25519KeyPair;
use serde::{Deserialize, Serialize};

use crate::util::{hex_encode, write_file};

/// The scope every bundle carries.
pub const BASE_SCOPE: &str = "policy:base";

//----------- BundleOptions ----------------------------------------------------

/// What to include in a build.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundleOptions {
    /// The requested scopes.  `policy:base` is implied.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Whether to produce a detached signature.
    #[serde(default = "default_true")]
    pub sign: bool,

    /// Whether to embed the hub's ground-truth data files.
    #[serde(default = "default_true")]
    pub include_data: bool,

    /// Whether to gzip the stored artifact.
    #[serde(default)]
    pub compress: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            scopes: Vec::new(),
            sign: true,
            include_data: true,
            compress: false,
        }
    }
}

//----------- Manifest ---------------------------------------------------------

/// One file in a bundle manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// The ordered file listing of a bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// The version string of the build that produced this manifest.
    pub revision: String,

    /// The scopes that selected the files.
    pub roots: BTreeSet<String>,

    /// Files in canonical (lexicographic path) order.
    pub files: Vec<ManifestFile>,
}

//----------- BundlePointer ----------------------------------------------------

/// The durable record of a built bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundlePointer {
    /// `bundle-<hex>`, derived from the content hash.
    pub bundle_id: String,

    /// `YYYY.MM.DD-NNN`, unique and strictly increasing.
    pub version: String,

    /// The content hash; identical inputs produce identical hashes.
    pub hash: String,

    /// Total content bytes.
    pub size: u64,

    pub file_count: usize,

    pub scopes: BTreeSet<String>,

    pub signed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<String>,

    /// Detached Ed25519 signature over the hash, base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    pub manifest: BundleManifest,
}

//----------- VersionCursor ----------------------------------------------------

/// The per-hub daily version sequence.
///
/// The counter restarts each UTC calendar day and increases strictly within
/// it.  The cursor is persisted so restarts never reuse a number.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VersionCursor {
    pub day: Option<Date>,
    pub seq: u32,
}

impl VersionCursor {
    /// Allocate the next version string for the given instant.
    pub fn allocate(&mut self, now: Timestamp) -> String {
        let today = now.to_zoned(jiff::tz::TimeZone::UTC).date();
        if self.day != Some(today) {
            self.day = Some(today);
            self.seq = 0;
        }
        self.seq += 1;
        format!(
            "{:04}.{:02}.{:02}-{:03}",
            today.year(),
            today.month(),
            today.day(),
            self.seq
        )
    }
}

//----------- BundleBuilder ----------------------------------------------------

/// Assembles bundles from the policy source tree.
pub struct BundleBuilder {
    policy_dir: Utf8PathBuf,
    artifact_dir: Utf8PathBuf,
    signing_key: Option<Ed25519KeyPair>,
    key_id: String,
}

impl fmt::Debug for BundleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleBuilder")
            .field("policy_dir", &self.policy_dir)
            .field("artifact_dir", &self.artifact_dir)
            .field("signing_key", &self.signing_key.is_some())
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl BundleBuilder {
    pub fn new(
        policy_dir: Utf8PathBuf,
        artifact_dir: Utf8PathBuf,
        signing_key: Option<Ed25519KeyPair>,
        key_id: String,
    ) -> Self {
        Self {
            policy_dir,
            artifact_dir,
            signing_key,
            key_id,
        }
    }

    /// Build a bundle.
    ///
    /// `version` must come from the hub's [`VersionCursor`]; `inline_data`
    /// carries the ground-truth files (trusted issuers, federation matrix,
    /// clearance equivalency) when the options ask for them.
    pub fn build(
        &self,
        options: &BundleOptions,
        version: String,
        inline_data: &[(String, Vec<u8>)],
        now: Timestamp,
    ) -> Result<BundlePointer, BuildError> {
        if options.sign && self.signing_key.is_none() {
            return Err(BuildError::MissingSigningKey);
        }

        let mut roots: BTreeSet<String> = options.scopes.iter().cloned().collect();
        roots.insert(BASE_SCOPE.to_owned());

        // Collect files per scope.  Unknown scopes select no subtree and
        // contribute nothing; they do not fail the build.
        let mut contents: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for scope in &roots {
            let Some(subtree) = scope.strip_prefix("policy:") else {
                continue;
            };
            let dir = self.policy_dir.join(subtree);
            if !dir.as_std_path().is_dir() {
                continue;
            }
            collect_files(&dir, &self.policy_dir, &mut contents)?;
        }

        if options.include_data {
            for (path, data) in inline_data {
                contents.insert(format!("data/{path}"), data.clone());
            }
        }

        // Per-file digests in parallel; the map keeps canonical order.
        let entries: Vec<(String, Vec<u8>)> = contents.into_iter().collect();
        let files: Vec<ManifestFile> = entries
            .par_iter()
            .map(|(path, content)| ManifestFile {
                path: path.clone(),
                size: content.len() as u64,
                sha256: hex_encode(digest::digest(&digest::SHA256, content).as_ref()),
            })
            .collect();

        // The bundle hash covers 'path\0content\n' in manifest order.
        let mut ctx = digest::Context::new(&digest::SHA256);
        for (path, content) in &entries {
            ctx.update(path.as_bytes());
            ctx.update(b"\0");
            ctx.update(content);
            ctx.update(b"\n");
        }
        let hash = hex_encode(ctx.finish().as_ref());

        let manifest = BundleManifest {
            revision: version.clone(),
            roots: roots.clone(),
            files,
        };

        let (signed, signed_at, signed_by, signature) = if options.sign {
            let key = self.signing_key.as_ref().unwrap();
            let sig = key.sign(hash.as_bytes());
            (
                true,
                Some(now),
                Some(self.key_id.clone()),
                Some(BASE64_STANDARD.encode(sig.as_ref())),
            )
        } else {
            (false, None, None, None)
        };

        let pointer = BundlePointer {
            bundle_id: format!("bundle-{}", &hash[..12]),
            version,
            hash,
            size: entries.iter().map(|(_, c)| c.len() as u64).sum(),
            file_count: entries.len(),
            scopes: roots,
            signed,
            signed_at,
            signed_by,
            signature,
            manifest,
        };

        self.store_artifact(&pointer, &entries, options.compress)?;
        Ok(pointer)
    }

    /// The scopes the policy source tree can satisfy.
    pub fn available_scopes(&self) -> io::Result<Vec<String>> {
        let mut scopes = vec![BASE_SCOPE.to_owned()];
        if !self.policy_dir.as_std_path().is_dir() {
            return Ok(scopes);
        }
        let mut subdirs: Vec<String> = std::fs::read_dir(self.policy_dir.as_std_path())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.') && name != "base")
            .map(|name| format!("policy:{name}"))
            .collect();
        subdirs.sort();
        scopes.extend(subdirs);
        Ok(scopes)
    }

    /// The artifact path for a content hash.
    pub fn artifact_path(&self, hash: &str) -> Utf8PathBuf {
        self.artifact_dir.join(format!("{hash}.bundle"))
    }

    /// Write the artifact, unless an identical one already exists.
    fn store_artifact(
        &self,
        pointer: &BundlePointer,
        entries: &[(String, Vec<u8>)],
        compress: bool,
    ) -> Result<(), BuildError> {
        let path = self.artifact_path(&pointer.hash);
        if path.as_std_path().exists() {
            // Content-addressed: the artifact is already on disk.
            return Ok(());
        }

        let artifact = Artifact {
            manifest: pointer.manifest.clone(),
            files: entries
                .iter()
                .map(|(path, content)| (path.clone(), BASE64_STANDARD.encode(content)))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&artifact)
            .map_err(|err| BuildError::Io(path.clone(), err.to_string()))?;

        let bytes = if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&json)
                .and_then(|()| encoder.finish())
                .map_err(|err| BuildError::Io(path.clone(), err.to_string()))?
        } else {
            json
        };

        write_file(&path, &bytes).map_err(|err| BuildError::Io(path, err.to_string()))
    }
}

/// The stored artifact format.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Artifact {
    manifest: BundleManifest,
    /// Path to base64 content.
    files: BTreeMap<String, String>,
}

/// Recursively collect files under `dir`, keyed by their path relative to
/// `root`.
fn collect_files(
    dir: &Utf8Path,
    root: &Utf8Path,
    out: &mut BTreeMap<String, Vec<u8>>,
) -> Result<(), BuildError> {
    let entries = std::fs::read_dir(dir.as_std_path())
        .map_err(|err| BuildError::Io(dir.to_owned(), err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| BuildError::Io(dir.to_owned(), err.to_string()))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            // Policy trees are expected to be UTF-8; skip anything else.
            continue;
        };
        let Some(name) = path.file_name() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if path.as_std_path().is_dir() {
            collect_files(&path, root, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("collected paths live under the policy root")
                .to_string();
            let content = std::fs::read(path.as_std_path())
                .map_err(|err| BuildError::Io(path.clone(), err.to_string()))?;
            out.insert(rel, content);
        }
    }
    Ok(())
}

//----------- BuildError -------------------------------------------------------

/// An error building a bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    /// A signed build was requested but no signing key is configured.
    MissingSigningKey,

    /// A filesystem error while collecting or storing.
    Io(Utf8PathBuf, String),
}

impl std::error::Error for BuildError {}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSigningKey => {
                f.write_str("a signed build was requested but no signing key is configured")
            }
            Self::Io(path, err) => write!(f, "{path}: {err}"),
        }
    }
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::KeyPair as _;

    struct Fixture {
        _tmp: tempfile::TempDir,
        builder: BundleBuilder,
    }

    fn fixture(signed: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let policy_dir = root.join("policies");
        let artifact_dir = root.join("bundles");

        for (path, contents) in [
            ("base/access.rego", "package base.access\n"),
            ("base/labels.rego", "package base.labels\n"),
            ("fvey/releasability.rego", "package fvey\n"),
            ("usa/national.rego", "package usa\n"),
        ] {
            let path = policy_dir.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }

        let signing_key = signed.then(|| {
            let doc = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
            Ed25519KeyPair::from_pkcs8(doc.as_ref()).unwrap()
        });

        Fixture {
            _tmp: tmp,
            builder: BundleBuilder::new(policy_dir, artifact_dir, signing_key, "hub-2026".into()),
        }
    }

    fn options(scopes: &[&str]) -> BundleOptions {
        BundleOptions {
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            sign: false,
            include_data: false,
            compress: false,
        }
    }

    #[test]
    fn identical_inputs_identical_hash() {
        let f = fixture(false);
        let opts = options(&["policy:fvey"]);
        let now = Timestamp::now();

        let a = f.builder.build(&opts, "2026.08.01-001".into(), &[], now).unwrap();
        let b = f.builder.build(&opts, "2026.08.01-002".into(), &[], now).unwrap();

        assert_eq!(a.hash, b.hash);
        assert_eq!(a.bundle_id, b.bundle_id);
        assert_ne!(a.version, b.version);
    }

    #[test]
    fn any_file_change_changes_the_hash() {
        let f = fixture(false);
        let opts = options(&[]);
        let now = Timestamp::now();

        let a = f.builder.build(&opts, "v1".into(), &[], now).unwrap();
        std::fs::write(
            f.builder.policy_dir.join("base/access.rego"),
            "package base.access  # revised\n",
        )
        .unwrap();
        let b = f.builder.build(&opts, "v2".into(), &[], now).unwrap();

        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn base_scope_is_always_present() {
        let f = fixture(false);
        let now = Timestamp::now();

        let bundle = f
            .builder
            .build(&options(&["policy:fvey"]), "v1".into(), &[], now)
            .unwrap();
        assert!(bundle.scopes.contains(BASE_SCOPE));
        assert!(bundle
            .manifest
            .files
            .iter()
            .any(|file| file.path.starts_with("base/")));
        assert!(bundle
            .manifest
            .files
            .iter()
            .any(|file| file.path.starts_with("fvey/")));
        // The 'usa' subtree was not selected.
        assert!(!bundle
            .manifest
            .files
            .iter()
            .any(|file| file.path.starts_with("usa/")));
    }

    #[test]
    fn unknown_scopes_contribute_nothing() {
        let f = fixture(false);
        let now = Timestamp::now();

        let plain = f.builder.build(&options(&[]), "v1".into(), &[], now).unwrap();
        let with_unknown = f
            .builder
            .build(&options(&["policy:atlantis"]), "v2".into(), &[], now)
            .unwrap();

        assert_eq!(plain.manifest.files, with_unknown.manifest.files);
        assert_eq!(plain.hash, with_unknown.hash);
    }

    #[test]
    fn manifest_order_is_lexicographic() {
        let f = fixture(false);
        let now = Timestamp::now();
        let bundle = f
            .builder
            .build(&options(&["policy:fvey", "policy:usa"]), "v1".into(), &[], now)
            .unwrap();

        let paths: Vec<&str> = bundle.manifest.files.iter().map(|f| f.path.as_str()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
        assert!(bundle.file_count > 0);
        assert_eq!(bundle.file_count, bundle.manifest.files.len());
    }

    #[test]
    fn inline_data_lands_under_data() {
        let f = fixture(false);
        let now = Timestamp::now();
        let mut opts = options(&[]);
        opts.include_data = true;

        let data = vec![("trusted-issuers.json".to_owned(), b"[]".to_vec())];
        let bundle = f.builder.build(&opts, "v1".into(), &data, now).unwrap();
        assert!(bundle
            .manifest
            .files
            .iter()
            .any(|file| file.path == "data/trusted-issuers.json"));
    }

    #[test]
    fn signing_produces_a_verifiable_signature() {
        let f = fixture(true);
        let now = Timestamp::now();
        let mut opts = options(&[]);
        opts.sign = true;

        let bundle = f.builder.build(&opts, "v1".into(), &[], now).unwrap();
        assert!(bundle.signed);
        assert_eq!(bundle.signed_by.as_deref(), Some("hub-2026"));

        let sig = BASE64_STANDARD
            .decode(bundle.signature.as_deref().unwrap())
            .unwrap();
        let public_key = f.builder.signing_key.as_ref().unwrap().public_key();
        ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, public_key.as_ref())
            .verify(bundle.hash.as_bytes(), &sig)
            .unwrap();
    }

    #[test]
    fn signed_build_without_key_fails() {
        let f = fixture(false);
        let mut opts = options(&[]);
        opts.sign = true;
        assert_eq!(
            f.builder.build(&opts, "v1".into(), &[], Timestamp::now()),
            Err(BuildError::MissingSigningKey)
        );
    }

    #[test]
    fn artifacts_are_content_addressed() {
        let f = fixture(false);
        let now = Timestamp::now();
        let opts = options(&[]);

        let a = f.builder.build(&opts, "v1".into(), &[], now).unwrap();
        assert!(f.builder.artifact_path(&a.hash).as_std_path().exists());

        // A rebuild with identical content re-points at the same artifact.
        let before = std::fs::metadata(f.builder.artifact_path(&a.hash).as_std_path())
            .unwrap()
            .modified()
            .unwrap();
        let b = f.builder.build(&opts, "v2".into(), &[], now).unwrap();
        let after = std::fs::metadata(f.builder.artifact_path(&b.hash).as_std_path())
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn version_cursor_restarts_daily() {
        let mut cursor = VersionCursor::default();
        let day1: Timestamp = "2026-08-01T10:00:00Z".parse().unwrap();
        let day2: Timestamp = "2026-08-02T00:30:00Z".parse().unwrap();

        assert_eq!(cursor.allocate(day1), "2026.08.01-001");
        assert_eq!(cursor.allocate(day1), "2026.08.01-002");
        assert_eq!(cursor.allocate(day2), "2026.08.02-001");
    }

    #[test]
    fn available_scopes_reflect_the_tree() {
        let f = fixture(false);
        let scopes = f.builder.available_scopes().unwrap();
        assert_eq!(scopes[0], BASE_SCOPE);
        assert!(scopes.contains(&"policy:fvey".to_owned()));
        assert!(scopes.contains(&"policy:usa".to_owned()));
    }
}
