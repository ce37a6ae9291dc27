//! Certificate inspection for TLS secrets.
//!
//! Only certificate keys (`ca.crt`, `tls.crt`, and `root.crt` for pgv2) are
//! read. Private keys stay in the secret and are never decoded or written.
//! Each key renders as a block starting with `<key>:` followed by one
//! `Certificate:` section per certificate in the chain.

use crate::client::SecretData;
use crate::engines;
use crate::models::{DecodedSecret, EngineKind, SecretRecord};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;

/// Fields pulled out of one X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCert {
    /// X.509 version, 1-based
    pub version: u32,
    /// Colon-separated hex
    pub serial: String,
    /// Signature algorithm OID or name
    pub signature_algorithm: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Subject distinguished name
    pub subject: String,
    /// Start of validity, UTC ISO 8601
    pub not_before: String,
    /// End of validity, UTC ISO 8601
    pub not_after: String,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// Whether basic constraints mark it as a CA
    pub is_ca: bool,
    /// Colon-separated uppercase hex of the SHA-256 digest of the DER bytes
    pub fingerprint_sha256: String,
}

/// Result of decoding one key of a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyReport {
    /// Certificates in file order
    Decoded(Vec<DecodedCert>),
    /// Why the key could not be decoded
    Error(String),
}

/// One certificate key of a secret and what was found in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInspection {
    /// Key inside the secret, e.g. `ca.crt`
    pub key: String,
    /// What decoding that key produced
    pub report: KeyReport,
}

/// Decodes every certificate key the engine cares about that is present in
/// the secret, in the engine's key order.
pub fn inspect(secret: &SecretData, engine: EngineKind) -> Vec<KeyInspection> {
    let keys = engines::profile(engine).map_or(&[][..], |p| p.cert_keys);
    keys.iter()
        .filter_map(|key| {
            secret.get(key).map(|bytes| KeyInspection {
                key: (*key).to_string(),
                report: match decode_chain(bytes) {
                    Ok(certs) => KeyReport::Decoded(certs),
                    Err(e) => KeyReport::Error(e),
                },
            })
        })
        .collect()
}

/// Inspects a secret and renders the result as the archive entry text.
pub fn decode_secret(record: SecretRecord, secret: &SecretData, engine: EngineKind) -> DecodedSecret {
    let inspections = inspect(secret, engine);
    let text = render(&inspections);
    DecodedSecret { record, text }
}

/// Renders inspections in an `openssl x509 -text` inspired layout.
pub fn render(inspections: &[KeyInspection]) -> String {
    if inspections.is_empty() {
        return "no certificate keys present\n".to_string();
    }

    let mut out = String::new();
    for inspection in inspections {
        let _ = writeln!(out, "{}:", inspection.key);
        match &inspection.report {
            KeyReport::Error(e) => {
                let _ = writeln!(out, "error: {}", e);
            }
            KeyReport::Decoded(certs) => {
                for cert in certs {
                    render_cert(&mut out, cert);
                }
            }
        }
        out.push('\n');
    }
    out
}

fn render_cert(out: &mut String, cert: &DecodedCert) {
    let _ = writeln!(out, "Certificate:");
    let _ = writeln!(out, "    Version: {}", cert.version);
    let _ = writeln!(out, "    Serial Number: {}", cert.serial);
    let _ = writeln!(out, "    Signature Algorithm: {}", cert.signature_algorithm);
    let _ = writeln!(out, "    Issuer: {}", cert.issuer);
    let _ = writeln!(out, "    Validity:");
    let _ = writeln!(out, "        Not Before: {}", cert.not_before);
    let _ = writeln!(out, "        Not After : {}", cert.not_after);
    let _ = writeln!(out, "    Subject: {}", cert.subject);
    if !cert.dns_names.is_empty() {
        let _ = writeln!(
            out,
            "    Subject Alternative Names: {}",
            cert.dns_names
                .iter()
                .map(|n| format!("DNS:{}", n))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    let _ = writeln!(out, "    CA: {}", cert.is_ca);
    let _ = writeln!(out, "    SHA256 Fingerprint: {}", cert.fingerprint_sha256);
}

/// Decodes a PEM bundle, or a single DER certificate when no PEM header is
/// present.
pub fn decode_chain(bytes: &[u8]) -> Result<Vec<DecodedCert>, String> {
    let mut certs = Vec::new();
    for block in Pem::iter_from_buffer(bytes) {
        let block = block.map_err(|e| format!("invalid PEM: {}", e))?;
        if block.label != "CERTIFICATE" {
            continue;
        }
        certs.push(decode_der(&block.contents)?);
    }

    if !certs.is_empty() {
        return Ok(certs);
    }
    if bytes.trim_ascii_start().starts_with(b"-----BEGIN") {
        return Err("no CERTIFICATE block found".to_string());
    }
    if bytes.trim_ascii().is_empty() {
        return Err("empty certificate data".to_string());
    }
    decode_der(bytes).map(|cert| vec![cert])
}

fn decode_der(der: &[u8]) -> Result<DecodedCert, String> {
    let (rest, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| format!("invalid X.509 certificate: {}", e))?;
    let consumed = &der[..der.len() - rest.len()];

    let validity = cert.validity();
    let dns_names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some((*dns).to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(DecodedCert {
        version: cert.version().0 + 1,
        serial: cert.raw_serial_as_string(),
        signature_algorithm: algorithm_name(&cert.signature_algorithm.algorithm.to_id_string()),
        issuer: cert.issuer().to_string(),
        subject: cert.subject().to_string(),
        not_before: format_time(validity.not_before.timestamp()),
        not_after: format_time(validity.not_after.timestamp()),
        dns_names,
        is_ca: cert.is_ca(),
        fingerprint_sha256: fingerprint(consumed),
    })
}

fn algorithm_name(oid: &str) -> String {
    let name = match oid {
        "1.2.840.113549.1.1.5" => "sha1WithRSAEncryption",
        "1.2.840.113549.1.1.11" => "sha256WithRSAEncryption",
        "1.2.840.113549.1.1.12" => "sha384WithRSAEncryption",
        "1.2.840.113549.1.1.13" => "sha512WithRSAEncryption",
        "1.2.840.10045.4.3.2" => "ecdsa-with-SHA256",
        "1.2.840.10045.4.3.3" => "ecdsa-with-SHA384",
        "1.2.840.10045.4.3.4" => "ecdsa-with-SHA512",
        "1.3.101.112" => "ED25519",
        other => return other.to_string(),
    };
    name.to_string()
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// SHA-256 of DER bytes as colon-separated uppercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    hex::encode_upper(digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}
