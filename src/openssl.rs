//! Optional OpenSSL module for signature production.
//!
//! This module provides an OpenSSL-based implementation of the signature
//! producer. See [`OpenSslSigner`]. It is enabled by the `openssl` feature.

use std::fs;
use std::path::Path;

use anyhow::Context;
use openssl::pkcs12::Pkcs12;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;
use thiserror::Error;

use crate::Pkcs7Signer;

#[derive(Error, Debug)]
pub enum Error {
    #[error("must contain a private key and a valid certificate chain")]
    IncompleteBundle,
    #[error("the certificate's key usage must include digital signatures or non-repudiation")]
    KeyUsage,
    #[error("the certificate's extended key usage must include S/MIME")]
    ExtendedKeyUsage,
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
}

/// OpenSSL implementation of the signature producer, built around a
/// PKCS #12 key bundle.
pub struct OpenSslSigner {
    key: PKey<Private>,
    certificate: X509,
    chain: Stack<X509>,
}

impl std::fmt::Debug for OpenSslSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSslSigner").finish_non_exhaustive()
    }
}

impl OpenSslSigner {
    /// Loads the signing key and certificate chain from a PKCS #12 bundle.
    pub fn from_pkcs12(der: &[u8], passphrase: &str) -> crate::Result<Self> {
        let parsed = Pkcs12::from_der(der)?.parse2(passphrase)?;
        let (Some(key), Some(certificate)) = (parsed.pkey, parsed.cert) else {
            return Err(Error::IncompleteBundle.into());
        };
        check_usage(&certificate)?;

        let chain = match parsed.ca {
            Some(chain) => chain,
            None => Stack::new()?,
        };
        Ok(OpenSslSigner {
            key,
            certificate,
            chain,
        })
    }

    /// Reads a PKCS #12 bundle from the filesystem.
    pub fn from_pkcs12_file<P: AsRef<Path>>(path: P, passphrase: &str) -> crate::Result<Self> {
        let path = path.as_ref();
        let der = fs::read(path).with_context(|| path.display().to_string())?;
        Self::from_pkcs12(&der, passphrase).with_context(|| path.display().to_string())
    }
}

/// Refuse certificates that can only produce useless signatures; this makes
/// pdfsig from poppler happy at least, and NSS by extension. An absent
/// extension leaves the usage unrestricted.
fn check_usage(certificate: &X509) -> crate::Result<()> {
    let der = certificate.to_der()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| Error::InvalidCertificate(e.to_string()))?;

    if let Some(usage) = parsed
        .key_usage()
        .map_err(|e| Error::InvalidCertificate(e.to_string()))?
    {
        if !usage.value.digital_signature() && !usage.value.non_repudiation() {
            return Err(Error::KeyUsage.into());
        }
    }
    if let Some(extended) = parsed
        .extended_key_usage()
        .map_err(|e| Error::InvalidCertificate(e.to_string()))?
    {
        if !extended.value.email_protection && !extended.value.any {
            return Err(Error::ExtendedKeyUsage.into());
        }
    }
    Ok(())
}

impl Pkcs7Signer for OpenSslSigner {
    /// Produces a SHA-256 detached PKCS #7 signature carrying the whole
    /// certificate chain.
    fn sign(&self, signed_data: [&[u8]; 2]) -> crate::Result<Vec<u8>> {
        // Unfortunately OpenSSL requires a contiguous array of bytes to
        // sign, so the ranges must be copied together.
        let mut contiguous =
            Vec::with_capacity(signed_data[0].len() + signed_data[1].len());
        contiguous.extend_from_slice(signed_data[0]);
        contiguous.extend_from_slice(signed_data[1]);

        let pkcs7 = Pkcs7::sign(
            &self.certificate,
            &self.key,
            &self.chain,
            &contiguous,
            Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY | Pkcs7Flags::NOSMIMECAP,
        )?;
        Ok(pkcs7.to_der()?)
    }
}
