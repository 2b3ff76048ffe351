//! Certificate collaborator: which certificate serves a domain, and whether
//! a peer's certificate is trusted for the domain it claims.

use std::path::{Path, PathBuf};

use base64::prelude::*;
use tracing::{debug, info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::XmppError;

/// Trust and lookup interface used by TLS setup and SASL EXTERNAL.
pub trait CertStore: Send + Sync {
    /// Whether a PEM certificate chains to (or is) a trusted certificate.
    fn trusted_for_peer(&self, pem: &str) -> bool;

    /// Whether a PEM certificate names `domain`, honoring `*.` wildcards.
    fn domain_matches(&self, pem: &str, domain: &str) -> bool;

    /// Certificate and key files serving `domain`, exact match first, then
    /// a wildcard certificate for its parent domain.
    fn files_for_domain(&self, domain: &str) -> Option<(PathBuf, PathBuf)>;
}

/// Certificates kept in one directory.
///
/// `<domain>.crt`/`<domain>.key` serve a domain and
/// `wildcard.<parent>.crt`/`.key` serve all its direct subdomains. Every
/// certificate found in `*.crt` or `*.pem` files is a trust anchor for peers.
pub struct DirCertStore {
    dir: PathBuf,
    anchors: Vec<Vec<u8>>,
}

impl DirCertStore {
    /// Load trust anchors from `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, XmppError> {
        let dir = dir.as_ref().to_path_buf();
        let mut anchors = Vec::new();

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %dir.display(), "Certificate directory missing, TLS disabled");
                return Ok(Self { dir, anchors });
            }
            Err(e) => {
                return Err(XmppError::config(format!(
                    "Failed to read certs dir {}: {}",
                    dir.display(),
                    e
                )))
            }
        };
        for entry in entries {
            let path = entry?.path();
            let is_cert = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("crt") | Some("pem")
            );
            if !is_cert {
                continue;
            }
            let pem = std::fs::read(&path)?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                match cert {
                    Ok(der) => anchors.push(der.as_ref().to_vec()),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable certificate"),
                }
            }
        }

        info!(dir = %dir.display(), anchors = anchors.len(), "Loaded certificate store");
        Ok(Self { dir, anchors })
    }

    fn pair(&self, stem: &str) -> Option<(PathBuf, PathBuf)> {
        let cert = self.dir.join(format!("{}.crt", stem));
        let key = self.dir.join(format!("{}.key", stem));
        (cert.is_file() && key.is_file()).then_some((cert, key))
    }
}

impl CertStore for DirCertStore {
    fn trusted_for_peer(&self, pem: &str) -> bool {
        let Some(der) = pem_to_der(pem) else {
            return false;
        };
        let Ok((_, cert)) = x509_parser::parse_x509_certificate(&der) else {
            return false;
        };
        if !cert.validity().is_valid() {
            debug!("Peer certificate outside its validity period");
            return false;
        }
        if self.anchors.iter().any(|anchor| anchor == &der) {
            return true;
        }

        self.anchors.iter().any(|anchor| {
            x509_parser::parse_x509_certificate(anchor)
                .map(|(_, anchor)| issued_by(&cert, &anchor))
                .unwrap_or(false)
        })
    }

    fn domain_matches(&self, pem: &str, domain: &str) -> bool {
        let Some(der) = pem_to_der(pem) else {
            return false;
        };
        let Ok((_, cert)) = x509_parser::parse_x509_certificate(&der) else {
            return false;
        };
        certificate_names(&cert)
            .iter()
            .any(|name| name_matches(name, domain))
    }

    fn files_for_domain(&self, domain: &str) -> Option<(PathBuf, PathBuf)> {
        self.pair(domain).or_else(|| {
            let (_, parent) = domain.split_once('.')?;
            self.pair(&format!("wildcard.{}", parent))
        })
    }
}

fn issued_by(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> bool {
    cert.issuer() == issuer.subject()
        && issuer.validity().is_valid()
        && cert.verify_signature(Some(issuer.public_key())).is_ok()
}

/// DNS names a certificate is valid for: SAN entries, else the subject CN.
fn certificate_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }
    if names.is_empty() {
        for cn in cert.subject().iter_common_name() {
            if let Ok(cn) = cn.as_str() {
                names.push(cn.to_string());
            }
        }
    }
    names
}

fn name_matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => domain
            .split_once('.')
            .map(|(label, rest)| !label.is_empty() && rest == suffix)
            .unwrap_or(false),
        None => pattern == domain,
    }
}

/// Decode the first certificate of a PEM document.
pub fn pem_to_der(pem: &str) -> Option<Vec<u8>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()?
        .ok()
        .map(|der| der.as_ref().to_vec())
}

/// Encode a DER certificate as PEM.
pub fn der_to_pem(der: &[u8]) -> String {
    let encoded = BASE64_STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::generate_simple_self_signed;

    fn write_pair(dir: &Path, stem: &str, names: Vec<String>) -> String {
        let certified = generate_simple_self_signed(names).unwrap();
        let pem = certified.cert.pem();
        std::fs::write(dir.join(format!("{}.crt", stem)), &pem).unwrap();
        std::fs::write(
            dir.join(format!("{}.key", stem)),
            certified.key_pair.serialize_pem(),
        )
        .unwrap();
        pem
    }

    #[test]
    fn test_missing_dir_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirCertStore::open(dir.path().join("absent")).unwrap();
        assert!(store.files_for_domain("example.com").is_none());
    }

    #[test]
    fn test_files_for_domain_exact_and_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "example.com", vec!["example.com".into()]);
        write_pair(dir.path(), "wildcard.example.org", vec!["*.example.org".into()]);
        let store = DirCertStore::open(dir.path()).unwrap();

        let (cert, key) = store.files_for_domain("example.com").unwrap();
        assert!(cert.ends_with("example.com.crt"));
        assert!(key.ends_with("example.com.key"));

        let (cert, _) = store.files_for_domain("chat.example.org").unwrap();
        assert!(cert.ends_with("wildcard.example.org.crt"));

        assert!(store.files_for_domain("example.net").is_none());
    }

    #[test]
    fn test_domain_matches() {
        let dir = tempfile::tempdir().unwrap();
        let exact = write_pair(dir.path(), "example.com", vec!["example.com".into()]);
        let wildcard = write_pair(dir.path(), "wildcard.example.org", vec!["*.example.org".into()]);
        let store = DirCertStore::open(dir.path()).unwrap();

        assert!(store.domain_matches(&exact, "example.com"));
        assert!(store.domain_matches(&exact, "EXAMPLE.com"));
        assert!(!store.domain_matches(&exact, "www.example.com"));
        assert!(store.domain_matches(&wildcard, "chat.example.org"));
        assert!(!store.domain_matches(&wildcard, "example.org"));
        assert!(!store.domain_matches(&wildcard, "a.b.example.org"));
    }

    #[test]
    fn test_trusted_for_peer() {
        let dir = tempfile::tempdir().unwrap();
        let pinned = write_pair(dir.path(), "remote.org", vec!["remote.org".into()]);
        let store = DirCertStore::open(dir.path()).unwrap();

        assert!(store.trusted_for_peer(&pinned));

        let stranger = generate_simple_self_signed(vec!["remote.org".into()])
            .unwrap()
            .cert
            .pem();
        assert!(!store.trusted_for_peer(&stranger));
        assert!(!store.trusted_for_peer("not a certificate"));
    }

    #[test]
    fn test_pem_der_roundtrip() {
        let pem = generate_simple_self_signed(vec!["example.com".into()])
            .unwrap()
            .cert
            .pem();
        let der = pem_to_der(&pem).unwrap();
        assert_eq!(pem_to_der(&der_to_pem(&der)), Some(der));
    }
}
