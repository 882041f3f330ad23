//! Signs PDF documents by appending an incremental update that carries a
//! detached PKCS #7 signature, leaving the original bytes intact.

#[cfg(feature = "openssl")]
pub mod openssl;

pub mod lexer;
pub mod object;
pub mod parser;
pub mod sign;
pub mod updater;

pub use object::{Dict, PdfObject};
pub use sign::sign;
pub use updater::{Updater, XrefEntry};

pub type Result<T> = anyhow::Result<T>;

/// Produces the detached PKCS #7 signature embedded in `/Contents`.
pub trait Pkcs7Signer {
    /// Signs the concatenation of the two byte ranges, returning the
    /// DER-encoded SignedData blob.
    fn sign(&self, signed_data: [&[u8]; 2]) -> Result<Vec<u8>>;
}
