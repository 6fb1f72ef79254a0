//! Validating spoke certificates.
//!
//! Spokes present a PEM certificate at registration; its SHA-256 DER
//! fingerprint becomes the spoke's bound identity.  Validation is strict
//! about parse failures, validity windows and weak signature algorithms,
//! and merely warns about self-signed or soon-expiring material.

use std::fmt;

use jiff::Timestamp;
use ring::digest;
use serde::{Deserialize, Serialize};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

use crate::util::hex_encode;

/// Certificates expiring within this many days draw a warning.
const EXPIRY_WARNING_DAYS: i64 = 30;

//----------- CertificateInfo --------------------------------------------------

/// The extracted identity of a validated certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CertificateInfo {
    /// Lowercase hex SHA-256 digest of the DER encoding.
    pub fingerprint: String,

    pub subject: String,
    pub issuer: String,

    pub not_before: Timestamp,
    pub not_after: Timestamp,

    /// The signature algorithm, by name where known, dotted OID otherwise.
    pub signature_algorithm: String,

    pub self_signed: bool,
}

//----------- CertificateWarning -----------------------------------------------

/// A non-fatal finding about a certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum CertificateWarning {
    /// The certificate is self-signed.
    SelfSigned,

    /// The certificate expires within the warning horizon.
    ExpiresSoon { days: i64 },
}

impl fmt::Display for CertificateWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfSigned => f.write_str("the certificate is self-signed"),
            Self::ExpiresSoon { days } => {
                write!(f, "the certificate expires in {days} days")
            }
        }
    }
}

//----------- CertificateError -------------------------------------------------

/// An error validating a certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertificateError {
    /// The PEM wrapper could not be parsed.
    InvalidPem,

    /// The DER contents could not be parsed.
    InvalidDer(String),

    /// The certificate has expired.
    Expired { not_after: Timestamp },

    /// The certificate is not yet valid.
    NotYetValid { not_before: Timestamp },

    /// The signature algorithm uses SHA-1 or weaker.
    WeakSignatureAlgorithm(String),
}

impl std::error::Error for CertificateError {}

impl fmt::Display for CertificateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPem => f.write_str("the certificate is not valid PEM"),
            Self::InvalidDer(reason) => {
                write!(f, "the certificate contents could not be parsed: {reason}")
            }
            Self::Expired { not_after } => {
                write!(f, "the certificate expired at {not_after}")
            }
            Self::NotYetValid { not_before } => {
                write!(f, "the certificate is not valid before {not_before}")
            }
            Self::WeakSignatureAlgorithm(name) => {
                write!(f, "the signature algorithm '{name}' is too weak")
            }
        }
    }
}

//----------- Validation -------------------------------------------------------

/// Validate a PEM certificate.
///
/// On success, returns the extracted identity together with any non-fatal
/// warnings.  `strict` controls whether weak signature algorithms reject.
pub fn validate_pem(
    pem: &str,
    strict: bool,
    now: Timestamp,
) -> Result<(CertificateInfo, Vec<CertificateWarning>), CertificateError> {
    let (_rest, pem) =
        parse_x509_pem(pem.as_bytes()).map_err(|_| CertificateError::InvalidPem)?;
    if pem.label != "CERTIFICATE" {
        return Err(CertificateError::InvalidPem);
    }

    let (_rest, cert) = x509_parser::certificate::X509Certificate::from_der(&pem.contents)
        .map_err(|err| CertificateError::InvalidDer(err.to_string()))?;

    let not_before = Timestamp::from_second(cert.validity().not_before.timestamp())
        .map_err(|err| CertificateError::InvalidDer(err.to_string()))?;
    let not_after = Timestamp::from_second(cert.validity().not_after.timestamp())
        .map_err(|err| CertificateError::InvalidDer(err.to_string()))?;

    if now > not_after {
        return Err(CertificateError::Expired { not_after });
    }
    if now < not_before {
        return Err(CertificateError::NotYetValid { not_before });
    }

    let oid = cert.signature_algorithm.algorithm.to_id_string();
    let (name, weak) = signature_algorithm(&oid);
    if strict && weak {
        return Err(CertificateError::WeakSignatureAlgorithm(name.to_owned()));
    }

    let subject = cert.subject().to_string();
    let issuer = cert.issuer().to_string();
    let self_signed = subject == issuer;

    let mut warnings = Vec::new();
    if self_signed {
        warnings.push(CertificateWarning::SelfSigned);
    }
    let remaining_days = (not_after.as_second() - now.as_second()) / 86_400;
    if remaining_days < EXPIRY_WARNING_DAYS {
        warnings.push(CertificateWarning::ExpiresSoon {
            days: remaining_days,
        });
    }

    let fingerprint = hex_encode(digest::digest(&digest::SHA256, &pem.contents).as_ref());

    Ok((
        CertificateInfo {
            fingerprint,
            subject,
            issuer,
            not_before,
            not_after,
            signature_algorithm: name.to_owned(),
            self_signed,
        },
        warnings,
    ))
}

/// Resolve a signature-algorithm OID to `(name, is_weak)`.
fn signature_algorithm(oid: &str) -> (&str, bool) {
    match oid {
        "1.2.840.113549.1.1.11" => ("sha256WithRSAEncryption", false),
        "1.2.840.113549.1.1.12" => ("sha384WithRSAEncryption", false),
        "1.2.840.113549.1.1.13" => ("sha512WithRSAEncryption", false),
        "1.2.840.10045.4.3.2" => ("ecdsa-with-SHA256", false),
        "1.2.840.10045.4.3.3" => ("ecdsa-with-SHA384", false),
        "1.2.840.10045.4.3.4" => ("ecdsa-with-SHA512", false),
        "1.3.101.112" => ("Ed25519", false),
        "1.2.840.113549.1.1.10" => ("rsassa-pss", false),
        "1.2.840.113549.1.1.5" => ("sha1WithRSAEncryption", true),
        "1.2.840.113549.1.1.4" => ("md5WithRSAEncryption", true),
        "1.2.840.113549.1.1.2" => ("md2WithRSAEncryption", true),
        "1.2.840.10045.4.1" => ("ecdsa-with-SHA1", true),
        "1.2.840.10040.4.3" => ("dsa-with-SHA1", true),
        other => (other, false),
    }
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_pem() -> String {
        rcgen::generate_simple_self_signed(vec!["spoke.example".to_owned()])
            .unwrap()
            .cert
            .pem()
    }

    #[test]
    fn valid_self_signed_warns_but_passes() {
        let pem = self_signed_pem();
        let (info, warnings) = validate_pem(&pem, true, Timestamp::now()).unwrap();

        assert_eq!(info.fingerprint.len(), 64);
        assert!(info.self_signed);
        assert_eq!(info.signature_algorithm, "ecdsa-with-SHA256");
        assert!(warnings.contains(&CertificateWarning::SelfSigned));
    }

    #[test]
    fn fingerprints_are_stable() {
        let pem = self_signed_pem();
        let (a, _) = validate_pem(&pem, true, Timestamp::now()).unwrap();
        let (b, _) = validate_pem(&pem, true, Timestamp::now()).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);

        let (other, _) = validate_pem(&self_signed_pem(), true, Timestamp::now()).unwrap();
        assert_ne!(a.fingerprint, other.fingerprint);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(
            validate_pem("not a certificate", true, Timestamp::now()),
            Err(CertificateError::InvalidPem)
        );
    }

    #[test]
    fn expired_certificates_are_rejected() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["old.example".to_owned()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2021, 1, 1);
        let pem = params.self_signed(&key).unwrap().pem();

        assert!(matches!(
            validate_pem(&pem, true, Timestamp::now()),
            Err(CertificateError::Expired { .. })
        ));
    }

    #[test]
    fn not_yet_valid_certificates_are_rejected() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["new.example".to_owned()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2990, 1, 1);
        params.not_after = rcgen::date_time_ymd(2999, 1, 1);
        let pem = params.self_signed(&key).unwrap().pem();

        assert!(matches!(
            validate_pem(&pem, true, Timestamp::now()),
            Err(CertificateError::NotYetValid { .. })
        ));
    }

    #[test]
    fn expiry_warning_horizon() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["soon.example".to_owned()]).unwrap();
        let now = Timestamp::now();
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        // Ten days of validity left.
        let expiry = time::OffsetDateTime::from_unix_timestamp(
            now.as_second() + 10 * 86_400,
        )
        .unwrap();
        params.not_after = expiry;
        let pem = params.self_signed(&key).unwrap().pem();

        let (_, warnings) = validate_pem(&pem, true, now).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, CertificateWarning::ExpiresSoon { days } if *days <= 10)));
    }
}
