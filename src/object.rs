use std::collections::BTreeMap;

/// Dictionary entries keyed by the decoded name bytes. A `BTreeMap` keeps
/// the serialization order deterministic.
pub type Dict = BTreeMap<Vec<u8>, PdfObject>;

pub(crate) const WHITESPACE: &[u8] = b"\t\n\x0c\r ";
pub(crate) const DELIMITERS: &[u8] = b"()<>[]{}/%";

/// PDF token/object thingy. Objects may be composed either from one or a
/// sequence of tokens. The PDF Reference doesn't actually speak of tokens,
/// though ISO 32000-1:2008 does.
#[derive(Debug, Clone, PartialEq)]
pub enum PdfObject {
    /// End of input; never leaves the parsing layer.
    End,
    Newline,
    Comment(Vec<u8>),
    Null,
    Bool(bool),
    Numeric(f64),
    Keyword(Vec<u8>),
    Name(Vec<u8>),
    String(Vec<u8>),
    // Simple tokens
    BArray,
    EArray,
    BDict,
    EDict,
    // Higher-level objects
    Array(Vec<PdfObject>),
    Dict(Dict),
    Indirect {
        n: u32,
        generation: u32,
        /// Everything collected up to `endobj`; the first object is the body.
        body: Vec<PdfObject>,
    },
    Reference {
        n: u32,
        generation: u32,
    },
}

impl PdfObject {
    /// Return whether this is a number without a fractional part.
    pub fn is_integer(&self) -> bool {
        matches!(self, PdfObject::Numeric(v) if v.fract() == 0.0)
    }

    /// The numeric value as a non-negative integer, e.g. a file offset.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PdfObject::Numeric(v)
                if v.fract() == 0.0 && *v >= 0.0 && *v <= u64::MAX as f64 =>
            {
                Some(*v as u64)
            }
            _ => None,
        }
    }

    /// The numeric value as an object number or generation, if it fits.
    pub fn as_uint(&self) -> Option<u32> {
        self.as_u64()
            .filter(|&v| v <= u64::from(u32::MAX))
            .map(|v| v as u32)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize(&mut out);
        out
    }

    /// Append the canonical textual form to `out`.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            PdfObject::Newline => out.push(b'\n'),
            PdfObject::Null => out.extend_from_slice(b"null"),
            PdfObject::Bool(true) => out.extend_from_slice(b"true"),
            PdfObject::Bool(false) => out.extend_from_slice(b"false"),
            PdfObject::Numeric(v) => {
                if self.is_integer() {
                    out.extend_from_slice(format!("{}", *v as i64).as_bytes());
                } else {
                    out.extend_from_slice(format!("{}", v).as_bytes());
                }
            }
            PdfObject::Keyword(word) => out.extend_from_slice(word),
            PdfObject::Name(name) => write_name(name, out),
            PdfObject::String(bytes) => {
                out.push(b'(');
                for &b in bytes {
                    if matches!(b, b'\\' | b'(' | b')') {
                        out.push(b'\\');
                    }
                    out.push(b);
                }
                out.push(b')');
            }
            PdfObject::BArray => out.push(b'['),
            PdfObject::EArray => out.push(b']'),
            PdfObject::BDict => out.extend_from_slice(b"<<"),
            PdfObject::EDict => out.extend_from_slice(b">>"),
            PdfObject::Array(items) => {
                out.extend_from_slice(b"[ ");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    item.serialize(out);
                }
                out.extend_from_slice(b" ]");
            }
            PdfObject::Dict(dict) => write_dict(dict, out),
            PdfObject::Indirect {
                n,
                generation,
                body,
            } => {
                out.extend_from_slice(format!("{} {} obj\n", n, generation).as_bytes());
                if let Some(first) = body.first() {
                    first.serialize(out);
                }
                out.extend_from_slice(b"\nendobj");
            }
            PdfObject::Reference { n, generation } => {
                out.extend_from_slice(format!("{} {} R", n, generation).as_bytes());
            }
            PdfObject::End | PdfObject::Comment(_) => {
                unreachable!("token not meant for serialization")
            }
        }
    }
}

pub(crate) fn write_dict(dict: &Dict, out: &mut Vec<u8>) {
    out.extend_from_slice(b"<<");
    for (key, value) in dict {
        out.push(b' ');
        write_name(key, out);
        out.push(b' ');
        value.serialize(out);
    }
    out.extend_from_slice(b" >>");
}

fn write_name(name: &[u8], out: &mut Vec<u8>) {
    out.push(b'/');
    for &b in name {
        if b == b'#' || DELIMITERS.contains(&b) || WHITESPACE.contains(&b) {
            out.extend_from_slice(format!("#{:02x}", b).as_bytes());
        } else {
            out.push(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Dict, PdfObject};

    #[test]
    fn scalars() {
        assert_eq!(PdfObject::Null.to_bytes(), b"null");
        assert_eq!(PdfObject::Bool(true).to_bytes(), b"true");
        assert_eq!(PdfObject::Bool(false).to_bytes(), b"false");
        assert_eq!(PdfObject::Numeric(42.0).to_bytes(), b"42");
        assert_eq!(PdfObject::Numeric(-7.0).to_bytes(), b"-7");
        assert_eq!(PdfObject::Numeric(0.5).to_bytes(), b"0.5");
    }

    #[test]
    fn integer_predicates() {
        assert!(PdfObject::Numeric(3.0).is_integer());
        assert!(!PdfObject::Numeric(3.25).is_integer());
        assert_eq!(PdfObject::Numeric(3.0).as_uint(), Some(3));
        assert_eq!(PdfObject::Numeric(-1.0).as_uint(), None);
        assert_eq!(PdfObject::Numeric(4294967296.0).as_uint(), None);
        assert_eq!(PdfObject::Numeric(4294967296.0).as_u64(), Some(4294967296));
    }

    #[test]
    fn name_escaping() {
        assert_eq!(PdfObject::Name(b"Type".to_vec()).to_bytes(), b"/Type");
        assert_eq!(
            PdfObject::Name(b"A B/C#1".to_vec()).to_bytes(),
            b"/A#20B#2fC#231"
        );
    }

    #[test]
    fn string_escaping() {
        assert_eq!(
            PdfObject::String(br"a(b)c\d".to_vec()).to_bytes(),
            br"(a\(b\)c\\d)"
        );
    }

    #[test]
    fn composites() {
        let array = PdfObject::Array(vec![
            PdfObject::Numeric(0.0),
            PdfObject::Reference { n: 1, generation: 0 },
        ]);
        assert_eq!(array.to_bytes(), b"[ 0 1 0 R ]");
        assert_eq!(PdfObject::Array(Vec::new()).to_bytes(), b"[  ]");

        let mut dict = Dict::new();
        dict.insert(b"Size".to_vec(), PdfObject::Numeric(4.0));
        dict.insert(b"Root".to_vec(), PdfObject::Reference { n: 1, generation: 0 });
        assert_eq!(
            PdfObject::Dict(dict).to_bytes(),
            b"<< /Root 1 0 R /Size 4 >>"
        );
    }

    #[test]
    fn indirect_object() {
        let object = PdfObject::Indirect {
            n: 9,
            generation: 0,
            body: vec![PdfObject::Null],
        };
        assert_eq!(object.to_bytes(), b"9 0 obj\nnull\nendobj");
    }
}
