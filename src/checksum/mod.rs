//! Content fingerprinting for pipeline artifacts.
//!
//! This module computes stable checksums over step outputs so the planner
//! can decide whether a previously completed step can be skipped. Files are
//! hashed over their full byte content; directories are hashed over their
//! canonicalized recursive content (files sorted by relative path, each
//! contributing its path and content digest to the combined hash).
//!
//! Verification is read-only and decidable: a missing artifact verifies as
//! `false`, it is not an error.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256, Sha512};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors that can occur while computing a fingerprint.
#[derive(Debug, Error)]
pub enum ChecksumError {
    /// Failed to read the artifact from the filesystem.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to traverse a directory artifact.
    #[error("Directory traversal error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Hash algorithm used for artifact fingerprints.
///
/// The algorithm is recorded as a prefix inside every [`Digest`], so a
/// configuration change is detected as drift rather than silently matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256 (default).
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::Sha256
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(format!(
                "unknown checksum algorithm '{other}': expected 'sha256' or 'sha512'"
            )),
        }
    }
}

/// A recorded artifact fingerprint, e.g. `sha256:ab12...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactDigest(String);

impl ArtifactDigest {
    /// Wraps an already-formatted digest string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Computes and verifies artifact fingerprints.
///
/// All operations are synchronous and read-only: the validator is called
/// from planning and recovery paths that must not suspend mid-check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumValidator {
    algorithm: ChecksumAlgorithm,
}

impl ChecksumValidator {
    /// Creates a validator using the given algorithm.
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Returns the configured algorithm.
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Computes the fingerprint of a file or directory artifact.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumError` if the artifact does not exist or cannot be
    /// read. Callers that need missing-artifact to be a decidable outcome
    /// should use [`verify`](Self::verify) instead.
    pub fn fingerprint(&self, path: &Path) -> Result<ArtifactDigest, ChecksumError> {
        let raw = match self.algorithm {
            ChecksumAlgorithm::Sha256 => fingerprint_with::<Sha256>(path)?,
            ChecksumAlgorithm::Sha512 => fingerprint_with::<Sha512>(path)?,
        };
        Ok(ArtifactDigest(format!(
            "{}:{}",
            self.algorithm,
            hex::encode(raw)
        )))
    }

    /// Computes a single combined fingerprint over several artifacts.
    ///
    /// Each artifact's digest contributes to the combined hash in the order
    /// given, so the result is sensitive to both content and declaration
    /// order.
    pub fn fingerprint_many(&self, paths: &[&Path]) -> Result<ArtifactDigest, ChecksumError> {
        if paths.len() == 1 {
            return self.fingerprint(paths[0]);
        }
        let mut digests = Vec::with_capacity(paths.len());
        for path in paths {
            digests.push(self.fingerprint(path)?);
        }
        Ok(self.combine(&digests))
    }

    /// Combines already-computed digests into a single fingerprint.
    ///
    /// Order-sensitive: the combined digest changes when the input digests
    /// are reordered, matching declaration-order semantics for multi-output
    /// steps.
    pub fn combine(&self, digests: &[ArtifactDigest]) -> ArtifactDigest {
        let mut combined = Vec::new();
        for digest in digests {
            combined.extend_from_slice(digest.as_str().as_bytes());
            combined.push(0);
        }
        let raw = match self.algorithm {
            ChecksumAlgorithm::Sha256 => hash_bytes::<Sha256>(&combined),
            ChecksumAlgorithm::Sha512 => hash_bytes::<Sha512>(&combined),
        };
        ArtifactDigest(format!("{}:{}", self.algorithm, hex::encode(raw)))
    }

    /// Checks whether an artifact matches an expected fingerprint.
    ///
    /// A missing artifact verifies as `false` — absence is a decidable
    /// outcome for the planner, not an exceptional one.
    pub fn verify(&self, path: &Path, expected: &ArtifactDigest) -> Result<bool, ChecksumError> {
        if !path.exists() {
            return Ok(false);
        }
        let actual = self.fingerprint(path)?;
        Ok(actual == *expected)
    }

    /// Combined-fingerprint variant of [`verify`](Self::verify).
    pub fn verify_many(
        &self,
        paths: &[&Path],
        expected: &ArtifactDigest,
    ) -> Result<bool, ChecksumError> {
        if paths.iter().any(|p| !p.exists()) {
            return Ok(false);
        }
        let actual = self.fingerprint_many(paths)?;
        Ok(actual == *expected)
    }
}

/// Hashes a file or directory with a concrete hasher type.
fn fingerprint_with<D>(path: &Path) -> Result<Vec<u8>, ChecksumError>
where
    D: Sha2Digest + Write,
{
    if path.is_dir() {
        hash_directory::<D>(path)
    } else {
        hash_file::<D>(path)
    }
}

/// Streams a file's content through the hasher.
fn hash_file<D>(path: &Path) -> Result<Vec<u8>, ChecksumError>
where
    D: Sha2Digest + Write,
{
    let mut file = std::fs::File::open(path)?;
    let mut hasher = D::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

/// Hashes a directory's canonicalized recursive content.
///
/// Only files contribute; entries are ordered byte-wise by their lossy-UTF-8
/// relative path. Each file adds `rel_path \0 content_digest \0` to the
/// combined hash, so renames and content changes are both visible.
fn hash_directory<D>(root: &Path) -> Result<Vec<u8>, ChecksumError>
where
    D: Sha2Digest + Write,
{
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            files.push((rel, entry.into_path()));
        }
    }
    files.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut hasher = D::new();
    for (rel, path) in files {
        let content_digest = hash_file::<D>(&path)?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(&content_digest);
        hasher.update([0u8]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Hashes an in-memory byte slice.
fn hash_bytes<D>(data: &[u8]) -> Vec<u8>
where
    D: Sha2Digest,
{
    let mut hasher = D::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_algorithm_parse_and_display() {
        assert_eq!(
            "sha256".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Sha256
        );
        assert_eq!(
            "SHA512".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Sha512
        );
        assert!("md5".parse::<ChecksumAlgorithm>().is_err());
        assert_eq!(ChecksumAlgorithm::Sha256.to_string(), "sha256");
    }

    #[test]
    fn test_file_fingerprint_is_stable() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, b"pipeline artifact").unwrap();

        let validator = ChecksumValidator::default();
        let first = validator.fingerprint(&path).unwrap();
        let second = validator.fingerprint(&path).unwrap();

        assert_eq!(first, second);
        assert!(first.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_file_fingerprint_changes_with_content() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.bin");
        let validator = ChecksumValidator::default();

        fs::write(&path, b"before").unwrap();
        let before = validator.fingerprint(&path).unwrap();

        fs::write(&path, b"after").unwrap();
        let after = validator.fingerprint(&path).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_directory_fingerprint_is_order_independent() {
        let validator = ChecksumValidator::default();

        let dir_a = TempDir::new().expect("Failed to create temp dir");
        fs::write(dir_a.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir_a.path().join("b.txt"), b"beta").unwrap();

        // Same content created in the opposite order.
        let dir_b = TempDir::new().expect("Failed to create temp dir");
        fs::write(dir_b.path().join("b.txt"), b"beta").unwrap();
        fs::write(dir_b.path().join("a.txt"), b"alpha").unwrap();

        let digest_a = validator.fingerprint(dir_a.path()).unwrap();
        let digest_b = validator.fingerprint(dir_b.path()).unwrap();
        assert_eq!(digest_a, digest_b);
    }

    #[test]
    fn test_directory_fingerprint_sees_renames() {
        let validator = ChecksumValidator::default();

        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        let before = validator.fingerprint(dir.path()).unwrap();

        fs::rename(dir.path().join("a.txt"), dir.path().join("renamed.txt")).unwrap();
        let after = validator.fingerprint(dir.path()).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_verify_missing_artifact_is_false_not_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let missing = temp_dir.path().join("nope.bin");
        let validator = ChecksumValidator::default();

        let ok = validator
            .verify(&missing, &ArtifactDigest::new("sha256:00"))
            .expect("Missing artifact should be decidable");
        assert!(!ok);
    }

    #[test]
    fn test_verify_detects_mutation() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("out.txt");
        let validator = ChecksumValidator::default();

        fs::write(&path, b"good").unwrap();
        let digest = validator.fingerprint(&path).unwrap();
        assert!(validator.verify(&path, &digest).unwrap());

        fs::write(&path, b"tampered").unwrap();
        assert!(!validator.verify(&path, &digest).unwrap());
    }

    #[test]
    fn test_fingerprint_many_is_order_sensitive() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        fs::write(&a, b"one").unwrap();
        fs::write(&b, b"two").unwrap();

        let validator = ChecksumValidator::default();
        let forward = validator.fingerprint_many(&[&a, &b]).unwrap();
        let reverse = validator.fingerprint_many(&[&b, &a]).unwrap();
        assert_ne!(forward, reverse);
    }

    #[test]
    fn test_verify_many_missing_member_is_false() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        fs::write(&a, b"one").unwrap();
        fs::write(&b, b"two").unwrap();

        let validator = ChecksumValidator::default();
        let digest = validator.fingerprint_many(&[&a, &b]).unwrap();
        assert!(validator.verify_many(&[&a, &b], &digest).unwrap());

        fs::remove_file(&b).unwrap();
        assert!(!validator.verify_many(&[&a, &b], &digest).unwrap());
    }

    #[test]
    fn test_sha512_digest_prefix() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data");
        fs::write(&path, b"content").unwrap();

        let validator = ChecksumValidator::new(ChecksumAlgorithm::Sha512);
        let digest = validator.fingerprint(&path).unwrap();
        assert!(digest.as_str().starts_with("sha512:"));

        // An algorithm change shows up as a mismatch, never a silent match.
        let sha256 = ChecksumValidator::new(ChecksumAlgorithm::Sha256);
        assert!(!sha256.verify(&path, &digest).unwrap());
    }
}
