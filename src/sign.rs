use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, Local};
use thiserror::Error;

use crate::object::{Dict, PdfObject};
use crate::updater::Updater;
use crate::{Pkcs7Signer, Result};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("trailer does not contain a reference to Root")]
    MissingRoot,
    #[error("invalid Root dictionary reference")]
    InvalidRoot,
    #[error("invalid Pages reference")]
    InvalidPages,
    #[error("invalid or unsupported page tree")]
    InvalidPageTree,
    #[error("unexpected Annots")]
    UnexpectedAnnots,
    #[error("the document already contains forms, they would be overwritten")]
    AcroFormPresent,
    #[error("not enough space reserved for /ByteRange")]
    ByteRangeReserve,
    #[error("not enough space reserved for the signature ({reserved} nibbles vs {required} nibbles)")]
    SignatureReserve { reserved: usize, required: usize },
}

/// Pages trees may in principle nest very deep, though no sane writer
/// produces anything close to this.
const PAGE_TREE_DEPTH_LIMIT: usize = 256;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Make a PDF string representing the given point in time.
fn pdf_date(now: DateTime<FixedOffset>) -> PdfObject {
    let mut date = now.format("D:%Y%m%d%H%M%S").to_string();
    let offset = now.offset().local_minus_utc();
    if offset == 0 {
        date.push('Z');
    } else {
        let minutes = offset.abs() / 60;
        let sign = if offset < 0 { '-' } else { '+' };
        date.push_str(&format!("{}{:02}'{:02}'", sign, minutes / 60, minutes % 60));
    }
    PdfObject::String(date.into_bytes())
}

/// Walk down the leftmost branch of the page tree until a leaf turns up.
fn first_page(pdf: &Updater, mut n: u32, mut generation: u32) -> Result<(u32, Dict)> {
    let mut seen = HashSet::new();
    for _ in 0..PAGE_TREE_DEPTH_LIMIT {
        if !seen.insert(n) {
            return Err(Error::InvalidPageTree.into());
        }
        let PdfObject::Dict(node) = pdf.get(n, generation)? else {
            return Err(Error::InvalidPageTree.into());
        };
        let kind = match node.get(b"Type".as_slice()) {
            Some(PdfObject::Name(kind)) => kind.clone(),
            _ => return Err(Error::InvalidPageTree.into()),
        };
        if kind == b"Page" {
            return Ok((n, node));
        }
        if kind != b"Pages" {
            return Err(Error::InvalidPageTree.into());
        }

        // An indirectly referenced Kids array is not supported here
        let Some(PdfObject::Array(kids)) = node.get(b"Kids".as_slice()) else {
            return Err(Error::InvalidPageTree.into());
        };
        let Some(&PdfObject::Reference {
            n: kid_n,
            generation: kid_generation,
        }) = kids.first()
        else {
            return Err(Error::InvalidPageTree.into());
        };
        n = kid_n;
        generation = kid_generation;
    }
    Err(Error::InvalidPageTree.into())
}

/// All bytes are signed, except for the signature hexstring itself.
fn fill_in_signature<S: Pkcs7Signer>(
    document: &mut Vec<u8>,
    sign_off: usize,
    sign_len: usize,
    signer: &S,
) -> Result<()> {
    let tail_off = sign_off + sign_len;
    let der = signer.sign([&document[..sign_off], &document[tail_off..]])?;
    if 2 * der.len() > sign_len - 2 {
        // The obvious solution would be to increase the reservation
        return Err(Error::SignatureReserve {
            reserved: sign_len - 2,
            required: 2 * der.len(),
        }
        .into());
    }
    for (i, &byte) in der.iter().enumerate() {
        document[sign_off + 1 + 2 * i] = HEX_DIGITS[usize::from(byte >> 4)];
        document[sign_off + 2 + 2 * i] = HEX_DIGITS[usize::from(byte & 0xf)];
    }
    Ok(())
}

/// Sign the document in place by appending an incremental update that adds
/// a hidden signature field, leaving the original bytes untouched.
///
/// The presumption is that the document is valid and that it doesn't employ
/// cross-reference streams from PDF 1.5, or at least constitutes a
/// hybrid-reference file.
///
/// `reservation` is the space in bytes set aside for the DER-encoded
/// signature; the hexstring placeholder in `/Contents` takes twice as much.
pub fn sign<S: Pkcs7Signer>(
    document: &mut Vec<u8>,
    reservation: u16,
    signer: &S,
) -> Result<()> {
    let mut pdf = Updater::new(document);
    pdf.initialize()?;

    let Some(&PdfObject::Reference {
        n: root_n,
        generation: root_generation,
    }) = pdf.trailer.get(b"Root".as_slice())
    else {
        return Err(Error::MissingRoot.into());
    };
    let PdfObject::Dict(mut root) = pdf.get(root_n, root_generation)? else {
        return Err(Error::InvalidRoot.into());
    };

    // 8.7 Digital Signatures - /signature dictionary/
    let sigdict_n = pdf.allocate();
    let mut byterange_off = 0;
    let byterange_len = 32; // fine for a gigabyte
    let mut sign_off = 0;
    let mut sign_len = 0;
    // The timestamp is important for Adobe Acrobat Reader DC.
    // The ideal would be to use RFC 3161.
    let date = pdf_date(Local::now().fixed_offset());
    pdf.update(sigdict_n, |document| {
        document.extend_from_slice(
            b"<< /Type/Sig /Filter/Adobe.PPKLite /SubFilter/adbe.pkcs7.detached\n   /M",
        );
        date.serialize(document);
        document.extend_from_slice(b" /ByteRange ");
        byterange_off = document.len();
        document.resize(document.len() + byterange_len, b' ');
        document.extend_from_slice(b"\n   /Contents <");
        // The hexstring quotes are excluded from signing along with the
        // signature itself
        sign_off = document.len() - 1;
        sign_len = 2 * usize::from(reservation) + 2;
        document.resize(document.len() + 2 * usize::from(reservation), b'0');
        document.extend_from_slice(b"> >>");
    });

    // 8.6.3 Field Types - Signature Fields
    // 8.4.5 Annotation Types - Widget Annotations
    // The Signature Annotation can be merged in, and Kids omitted
    let mut sigfield = Dict::new();
    sigfield.insert(b"FT".to_vec(), PdfObject::Name(b"Sig".to_vec()));
    sigfield.insert(
        b"V".to_vec(),
        PdfObject::Reference {
            n: sigdict_n,
            generation: 0,
        },
    );
    sigfield.insert(b"Subtype".to_vec(), PdfObject::Name(b"Widget".to_vec()));
    sigfield.insert(b"F".to_vec(), PdfObject::Numeric(2.0)); // Hidden
    sigfield.insert(b"T".to_vec(), PdfObject::String(b"Signature1".to_vec()));
    sigfield.insert(
        b"Rect".to_vec(),
        PdfObject::Array(vec![
            PdfObject::Numeric(0.0),
            PdfObject::Numeric(0.0),
            PdfObject::Numeric(0.0),
            PdfObject::Numeric(0.0),
        ]),
    );
    let sigfield = PdfObject::Dict(sigfield);

    let sigfield_n = pdf.allocate();
    pdf.update(sigfield_n, |document| sigfield.serialize(document));

    let Some(&PdfObject::Reference {
        n: pages_n,
        generation: pages_generation,
    }) = root.get(b"Pages".as_slice())
    else {
        return Err(Error::InvalidPages.into());
    };
    let (page_n, mut page) = first_page(&pdf, pages_n, pages_generation)?;

    match page
        .entry(b"Annots".to_vec())
        .or_insert_with(|| PdfObject::Array(Vec::new()))
    {
        PdfObject::Array(annots) => annots.push(PdfObject::Reference {
            n: sigfield_n,
            generation: 0,
        }),
        // TODO indirectly referenced arrays might not be that hard to support
        _ => return Err(Error::UnexpectedAnnots.into()),
    }
    let page = PdfObject::Dict(page);
    pdf.update(page_n, |document| page.serialize(document));

    // 8.6.1 Interactive Form Dictionary
    if root.contains_key(b"AcroForm".as_slice()) {
        return Err(Error::AcroFormPresent.into());
    }
    let mut acroform = Dict::new();
    acroform.insert(
        b"Fields".to_vec(),
        PdfObject::Array(vec![PdfObject::Reference {
            n: sigfield_n,
            generation: 0,
        }]),
    );
    // SignaturesExist | AppendOnly
    acroform.insert(b"SigFlags".to_vec(), PdfObject::Numeric(3.0));
    root.insert(b"AcroForm".to_vec(), PdfObject::Dict(acroform));

    // Upgrade the document version for SHA-256 etc.
    if pdf.version(&root) < 16 {
        root.insert(b"Version".to_vec(), PdfObject::Name(b"1.6".to_vec()));
    }

    let root = PdfObject::Dict(root);
    pdf.update(root_n, |document| root.serialize(document));
    pdf.flush_updates();

    // Now that the length of everything is known, store the byte ranges of
    // what is about to be signed, which is everything except the resulting
    // signature itself
    let tail_off = sign_off + sign_len;
    let tail_len = pdf.document.len() - tail_off;
    let ranges = format!("[0 {} {} {}]", sign_off, tail_off, tail_len);
    if ranges.len() > byterange_len {
        return Err(Error::ByteRangeReserve.into());
    }
    pdf.document[byterange_off..byterange_off + ranges.len()]
        .copy_from_slice(ranges.as_bytes());

    fill_in_signature(pdf.document, sign_off, sign_len, signer)
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use super::pdf_date;
    use crate::object::PdfObject;

    fn date_string(offset_seconds: i32) -> Vec<u8> {
        let zone = FixedOffset::east_opt(offset_seconds).unwrap();
        let date = zone.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        match pdf_date(date) {
            PdfObject::String(bytes) => bytes,
            other => panic!("expected a string, got {other:?}"),
        }
    }

    #[test]
    fn dates() {
        assert_eq!(date_string(0), b"D:20240102030405Z");
        assert_eq!(date_string(3600), b"D:20240102030405+01'00'");
        assert_eq!(date_string(-5 * 3600 - 1800), b"D:20240102030405-05'30'");
    }
}
