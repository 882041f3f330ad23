use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::bytes::Regex;
use thiserror::Error;

use crate::object::{self, Dict, PdfObject};
use crate::parser::Parser;
use crate::Result;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("cannot find startxref")]
    MissingStartXref,
    #[error("circular xref offsets")]
    CircularXref,
    #[error("invalid xref offset")]
    InvalidXrefOffset,
    #[error("invalid xref table")]
    InvalidXrefTable,
    #[error("unexpected EOF while looking for the trailer")]
    MissingTrailer,
    #[error("invalid xref section header")]
    InvalidSectionHeader,
    #[error("invalid xref entry")]
    InvalidXrefEntry,
    #[error("invalid trailer dictionary")]
    InvalidTrailer,
    #[error("invalid Prev offset")]
    InvalidPrevOffset,
    #[error("invalid or missing cross-reference table Size")]
    InvalidXrefSize,
    #[error("object mismatch")]
    ObjectMismatch,
    #[error("unexpected end of file")]
    UnexpectedEof,
}

/// One row of the cross-reference table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrefEntry {
    /// File offset of the object, or N of the next free entry.
    pub offset: u64,
    /// Object generation.
    pub generation: u32,
    /// Whether this object number has been deleted.
    pub free: bool,
}

impl Default for XrefEntry {
    fn default() -> Self {
        XrefEntry {
            offset: 0,
            generation: 0,
            free: true,
        }
    }
}

lazy_static! {
    // The last startxref in the window wins
    static ref STARTXREF: Regex =
        Regex::new(r"(?-u)[\s\S]*\sstartxref\s+(\d+)\s+%%EOF").unwrap();
    static ref VERSION: Regex =
        Regex::new(r"(?-u)(?:^|[\r\n])%(?:!PS-Adobe-\d\.\d )?PDF-(\d)\.(\d)[\r\n]").unwrap();
}

/// Helps read a PDF document and incrementally update it, appending objects
/// and a new cross-reference section at the tail.
pub struct Updater<'a> {
    /// The document bytes; everything is written at the end.
    pub document: &'a mut Vec<u8>,
    /// Cross-reference table, densely indexed by object number.
    xref: Vec<XrefEntry>,
    /// Current cross-reference table size, correlated to `xref.len()`.
    xref_size: u32,
    /// Object numbers rewritten by this update.
    updated: BTreeSet<u32>,
    /// The new trailer dictionary to be written, seeded from the old one.
    pub trailer: Dict,
}

impl<'a> Updater<'a> {
    pub fn new(document: &'a mut Vec<u8>) -> Self {
        Updater {
            document,
            xref: Vec::new(),
            xref_size: 0,
            updated: BTreeSet::new(),
            trailer: Dict::new(),
        }
    }

    /// Build the cross-reference table and prepare a new trailer dictionary.
    pub fn initialize(&mut self) -> Result<()> {
        // startxref only needs to be looked for roughly within the last
        // kibibyte of the document
        let window_start = self.document.len().saturating_sub(1024);
        let capture = STARTXREF
            .captures(&self.document[window_start..])
            .ok_or(Error::MissingStartXref)?;
        let mut xref_offset =
            parse_decimal(&capture[1]).ok_or(Error::MissingStartXref)?;
        let last_xref_offset = xref_offset;

        let mut loaded_xrefs = BTreeSet::new();
        let mut loaded_entries = BTreeSet::new();
        loop {
            if loaded_xrefs.contains(&xref_offset) {
                return Err(Error::CircularXref.into());
            }
            if xref_offset >= self.document.len() as u64 {
                return Err(Error::InvalidXrefOffset.into());
            }

            let mut parser = Parser::new(&self.document[xref_offset as usize..]);
            Self::load_xref(
                &mut self.xref,
                self.document.len(),
                &mut parser,
                &mut loaded_entries,
            )?;

            let mut throwaway_stack = Vec::new();
            let trailer = match parser.parse(&mut throwaway_stack)? {
                PdfObject::Dict(dict) => dict,
                _ => return Err(Error::InvalidTrailer.into()),
            };
            if loaded_xrefs.is_empty() {
                self.trailer = trailer.clone();
            }
            loaded_xrefs.insert(xref_offset);

            let Some(prev) = trailer.get(b"Prev".as_slice()) else {
                break;
            };
            xref_offset = prev.as_u64().ok_or(Error::InvalidPrevOffset)?;
        }

        self.trailer.insert(
            b"Prev".to_vec(),
            PdfObject::Numeric(last_xref_offset as f64),
        );
        self.xref_size = self
            .trailer
            .get(b"Size".as_slice())
            .and_then(PdfObject::as_uint)
            .filter(|&size| size > 0)
            .ok_or(Error::InvalidXrefSize)?;
        // The trailer may claim more objects than the sections provided
        if self.xref.len() < self.xref_size as usize {
            self.xref
                .resize_with(self.xref_size as usize, XrefEntry::default);
        }
        Ok(())
    }

    fn load_xref(
        xref: &mut Vec<XrefEntry>,
        document_len: usize,
        parser: &mut Parser,
        loaded_entries: &mut BTreeSet<u32>,
    ) -> Result<()> {
        let mut throwaway_stack = Vec::new();
        match parser.parse(&mut throwaway_stack)? {
            PdfObject::Keyword(ref word) if word.as_slice() == b"xref" => {}
            _ => return Err(Error::InvalidXrefTable.into()),
        }
        loop {
            let object = parser.parse(&mut throwaway_stack)?;
            if object == PdfObject::End {
                return Err(Error::MissingTrailer.into());
            }
            if let PdfObject::Keyword(ref word) = object {
                if word.as_slice() == b"trailer" {
                    return Ok(());
                }
            }

            let second = parser.parse(&mut throwaway_stack)?;
            let (Some(start), Some(count)) = (object.as_uint(), second.as_uint()) else {
                return Err(Error::InvalidSectionHeader.into());
            };
            for i in 0..count {
                let offset = parser.parse(&mut throwaway_stack)?;
                let generation = parser.parse(&mut throwaway_stack)?;
                let key = parser.parse(&mut throwaway_stack)?;

                let offset = offset
                    .as_u64()
                    .filter(|&offset| offset <= document_len as u64);
                let generation = generation
                    .as_uint()
                    .filter(|&generation| generation <= 65535);
                let (Some(offset), Some(generation), PdfObject::Keyword(key)) =
                    (offset, generation, key)
                else {
                    return Err(Error::InvalidXrefEntry.into());
                };
                let free = match key.as_slice() {
                    b"n" => false,
                    b"f" => true,
                    _ => return Err(Error::InvalidXrefEntry.into()),
                };

                let Some(n) = start.checked_add(i) else {
                    return Err(Error::InvalidXrefEntry.into());
                };
                // Entries from newer sections win
                if !loaded_entries.insert(n) {
                    continue;
                }
                if n as usize >= xref.len() {
                    xref.resize_with(n as usize + 1, XrefEntry::default);
                }
                xref[n as usize] = XrefEntry {
                    offset,
                    generation,
                    free,
                };
            }
        }
    }

    /// Try to extract the claimed PDF version as a positive decimal number,
    /// e.g. 17 for PDF 1.7. Returns zero on failure.
    pub fn version(&self, root: &Dict) -> u32 {
        if let Some(PdfObject::Name(name)) = root.get(b"Version".as_slice()) {
            if let &[major, b'.', minor] = name.as_slice() {
                if major.is_ascii_digit() && minor.is_ascii_digit() {
                    return u32::from(major - b'0') * 10 + u32::from(minor - b'0');
                }
            }
        }

        // The version comment only needs to be looked for roughly within
        // the first kibibyte of the document
        let window = &self.document[..self.document.len().min(1024)];
        if let Some(capture) = VERSION.captures(window) {
            return u32::from(capture[1][0] - b'0') * 10 + u32::from(capture[2][0] - b'0');
        }
        0
    }

    /// Retrieve an object by its number and generation; returns `Null` when
    /// the slot is free or the pair cannot possibly match.
    pub fn get(&self, n: u32, generation: u32) -> Result<PdfObject> {
        if n >= self.xref_size {
            return Ok(PdfObject::Null);
        }
        let entry = &self.xref[n as usize];
        if entry.free
            || entry.generation != generation
            || entry.offset >= self.document.len() as u64
        {
            return Ok(PdfObject::Null);
        }

        let mut parser = Parser::new(&self.document[entry.offset as usize..]);
        let mut stack = Vec::new();
        loop {
            match parser.parse(&mut stack)? {
                PdfObject::End => return Err(Error::UnexpectedEof.into()),
                PdfObject::Indirect {
                    n: object_n,
                    generation: object_generation,
                    body,
                } => {
                    if object_n != n || object_generation != generation {
                        return Err(Error::ObjectMismatch.into());
                    }
                    return Ok(body.into_iter().next().unwrap_or(PdfObject::Null));
                }
                object => stack.push(object),
            }
        }
    }

    /// Allocate a new object number.
    pub fn allocate(&mut self) -> u32 {
        let n = self.xref_size;
        self.xref_size += 1;
        if self.xref.len() < self.xref_size as usize {
            self.xref
                .resize_with(self.xref_size as usize, XrefEntry::default);
        }
        // The entry only gets a subsection in the update once it is filled
        // in; no attempt is made at fixing the linked list of free items
        n
    }

    /// Append an updated object to the end of the document. `fill` writes
    /// the object body and may consult the buffer length for offsets.
    pub fn update(&mut self, n: u32, fill: impl FnOnce(&mut Vec<u8>)) {
        let entry = &mut self.xref[n as usize];
        entry.offset = self.document.len() as u64 + 1;
        entry.free = false;
        let generation = entry.generation;
        self.updated.insert(n);

        self.document
            .extend_from_slice(format!("\n{} {} obj\n", n, generation).as_bytes());
        fill(&mut *self.document);
        self.document.extend_from_slice(b"\nendobj");
    }

    /// Write an updated cross-reference section and trailer.
    pub fn flush_updates(&mut self) {
        let mut groups: Vec<(u32, u32)> = Vec::new();
        let mut updated = self.updated.iter().copied().peekable();
        while let Some(first) = updated.next() {
            let mut count = 1;
            while updated.peek() == Some(&(first + count)) {
                updated.next();
                count += 1;
            }
            groups.push((first, count));
        }
        // "Each cross-reference section begins with a line containing the
        // keyword xref. Following this line are one or more cross-reference
        // subsections." -- 3.4.3 in PDF Reference, taken literally
        if groups.is_empty() {
            groups.push((0, 0));
        }

        let startxref = self.document.len() + 1;
        self.document.extend_from_slice(b"\nxref\n");
        for (first, count) in groups {
            self.document
                .extend_from_slice(format!("{} {}\n", first, count).as_bytes());
            for n in first..first + count {
                let entry = &self.xref[n as usize];
                let kind = if entry.free { 'f' } else { 'n' };
                self.document.extend_from_slice(
                    format!("{:010} {:05} {} \n", entry.offset, entry.generation, kind)
                        .as_bytes(),
                );
            }
        }

        self.trailer.insert(
            b"Size".to_vec(),
            PdfObject::Numeric(f64::from(self.xref_size)),
        );
        self.document.extend_from_slice(b"trailer\n");
        object::write_dict(&self.trailer, &mut *self.document);
        self.document
            .extend_from_slice(format!("\nstartxref\n{}\n%%EOF\n", startxref).as_bytes());
    }
}

fn parse_decimal(digits: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    for &b in digits {
        value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::{Error, Updater};
    use crate::object::PdfObject;

    /// Assembles a single-section PDF out of numbered object bodies,
    /// tracking real offsets.
    fn assemble(header: &str, objects: &[(u32, &str)], trailer_extra: &str) -> Vec<u8> {
        let mut document = format!("{header}\n").into_bytes();
        let mut offsets = Vec::new();
        for &(n, body) in objects {
            offsets.push((n, document.len()));
            document.extend_from_slice(format!("{n} 0 obj\n{body}\nendobj\n").as_bytes());
        }
        let size = objects.iter().map(|&(n, _)| n).max().unwrap_or(0) + 1;
        let xref_offset = document.len();
        document.extend_from_slice(b"xref\n0 1\n0000000000 65535 f \n");
        for (n, offset) in offsets {
            document.extend_from_slice(format!("{n} 1\n{offset:010} 00000 n \n").as_bytes());
        }
        document.extend_from_slice(
            format!(
                "trailer\n<< /Size {size} /Root 1 0 R{trailer_extra} >>\n\
                 startxref\n{xref_offset}\n%%EOF\n"
            )
            .as_bytes(),
        );
        document
    }

    fn sample() -> Vec<u8> {
        assemble(
            "%PDF-1.4",
            &[
                (1, "<< /Type /Catalog /Pages 2 0 R >>"),
                (2, "<< /Type /Pages /Kids [3 0 R] /Count 1 >>"),
                (3, "<< /Type /Page /Parent 2 0 R >>"),
            ],
            "",
        )
    }

    /// The offset announced by the final startxref line.
    fn startxref_offset(document: &[u8]) -> u64 {
        let text = String::from_utf8_lossy(document);
        let at = text.rfind("startxref\n").unwrap() + 10;
        text[at..].split_whitespace().next().unwrap().parse().unwrap()
    }

    #[test]
    fn initialize_builds_the_table() {
        let mut document = sample();
        let newest_xref = startxref_offset(&document);
        let mut pdf = Updater::new(&mut document);
        pdf.initialize().unwrap();

        // In-use entries resolve, free and out-of-range ones do not
        for n in 1..=3 {
            assert!(matches!(pdf.get(n, 0).unwrap(), PdfObject::Dict(_)), "{n}");
        }
        assert_eq!(pdf.get(0, 65535).unwrap(), PdfObject::Null);
        assert_eq!(pdf.get(3, 1).unwrap(), PdfObject::Null);
        assert_eq!(pdf.get(64, 0).unwrap(), PdfObject::Null);

        // The seed trailer points back at the newest xref section
        let prev = pdf.trailer.get(b"Prev".as_slice()).unwrap();
        assert_eq!(prev.as_u64(), Some(newest_xref));
        assert_eq!(
            pdf.trailer.get(b"Root".as_slice()),
            Some(&PdfObject::Reference { n: 1, generation: 0 })
        );
    }

    #[test]
    fn missing_startxref() {
        let mut document = b"%PDF-1.4\nno cross-reference section here\n".to_vec();
        let mut pdf = Updater::new(&mut document);
        let err = pdf.initialize().unwrap_err();
        assert_eq!(err.downcast_ref(), Some(&Error::MissingStartXref));
    }

    #[test]
    fn circular_prev_chain() {
        let mut document = sample();
        let second = document.len();
        document.extend_from_slice(
            format!(
                "xref\n0 0\ntrailer\n<< /Size 4 /Root 1 0 R /Prev {second} >>\n\
                 startxref\n{second}\n%%EOF\n"
            )
            .as_bytes(),
        );
        let mut pdf = Updater::new(&mut document);
        let err = pdf.initialize().unwrap_err();
        assert_eq!(err.downcast_ref(), Some(&Error::CircularXref));
    }

    #[test]
    fn object_mismatch() {
        // The xref claims object 2 where object 1 actually lives
        let mut document = b"%PDF-1.4\n".to_vec();
        let first = document.len();
        document.extend_from_slice(b"1 0 obj\n<< /Type /Catalog >>\nendobj\n");
        let xref_offset = document.len();
        document.extend_from_slice(
            format!("xref\n0 1\n0000000000 65535 f \n2 1\n{first:010} 00000 n \n").as_bytes(),
        );
        document.extend_from_slice(
            format!("trailer\n<< /Size 3 /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n")
                .as_bytes(),
        );

        let mut pdf = Updater::new(&mut document);
        pdf.initialize().unwrap();
        let err = pdf.get(2, 0).unwrap_err();
        assert_eq!(err.downcast_ref(), Some(&Error::ObjectMismatch));
    }

    #[test]
    fn version_sniffing() {
        let mut document = sample();
        let mut pdf = Updater::new(&mut document);
        pdf.initialize().unwrap();

        let PdfObject::Dict(mut root) = pdf.get(1, 0).unwrap() else {
            panic!("expected the catalog");
        };
        assert_eq!(pdf.version(&root), 14);

        root.insert(b"Version".to_vec(), PdfObject::Name(b"1.7".to_vec()));
        assert_eq!(pdf.version(&root), 17);

        root.insert(b"Version".to_vec(), PdfObject::Name(b"bogus".to_vec()));
        assert_eq!(pdf.version(&root), 14);
    }

    #[test]
    fn update_records_offsets() {
        let mut document = sample();
        let mut pdf = Updater::new(&mut document);
        pdf.initialize().unwrap();

        let n = pdf.allocate();
        assert_eq!(n, 4);
        pdf.update(n, |document| document.extend_from_slice(b"null"));

        assert!(pdf.document.ends_with(format!("\n{n} 0 obj\nnull\nendobj").as_bytes()));
        assert_eq!(pdf.get(n, 0).unwrap(), PdfObject::Null);
    }

    #[test]
    fn flush_groups_contiguous_runs() {
        let mut document = sample();
        let mut pdf = Updater::new(&mut document);
        pdf.initialize().unwrap();

        let first = pdf.allocate();
        let second = pdf.allocate();
        pdf.update(1, |document| {
            document.extend_from_slice(b"<< /Type /Catalog /Pages 2 0 R >>")
        });
        pdf.update(first, |document| document.extend_from_slice(b"null"));
        pdf.update(second, |document| document.extend_from_slice(b"true"));
        pdf.flush_updates();

        let text = String::from_utf8_lossy(pdf.document);
        assert!(text.contains("\nxref\n1 1\n"), "separate run for object 1");
        assert!(text.contains("\n4 2\n"), "coalesced run for objects 4-5");
        assert!(text.contains("/Size 6"));
        assert!(text.ends_with("%%EOF\n"));

        // startxref points at the newline-separated xref keyword
        let startxref = text.rfind("startxref\n").unwrap();
        let offset: usize = text[startxref + 10..text.len() - 7].trim().parse().unwrap();
        assert_eq!(&pdf.document[offset..offset + 4], b"xref");
    }

    #[test]
    fn reloading_after_flush_sees_updates() {
        let mut document = sample();
        let first_len = document.len();
        {
            let mut pdf = Updater::new(&mut document);
            pdf.initialize().unwrap();
            pdf.update(3, |document| {
                document.extend_from_slice(b"<< /Type /Page /Parent 2 0 R /Rotate 90 >>")
            });
            pdf.flush_updates();
        }
        assert!(document.len() > first_len);

        let mut pdf = Updater::new(&mut document);
        pdf.initialize().unwrap();
        let PdfObject::Dict(page) = pdf.get(3, 0).unwrap() else {
            panic!("expected the updated page");
        };
        assert_eq!(page.get(b"Rotate".as_slice()), Some(&PdfObject::Numeric(90.0)));
    }
}
