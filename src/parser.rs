use thiserror::Error;

use crate::lexer::Lexer;
use crate::object::{Dict, PdfObject};
use crate::Result;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("array doesn't end")]
    UnterminatedArray,
    #[error("unexpected '>>'")]
    StrayDictEnd,
    #[error("dictionary doesn't end")]
    UnterminatedDict,
    #[error("unbalanced dictionary")]
    UnbalancedDict,
    #[error("invalid dictionary key type")]
    InvalidDictKey,
    #[error("streams are not supported yet")]
    StreamsUnsupported,
    #[error("missing object ID pair")]
    MissingObjectId,
    #[error("invalid object ID pair")]
    InvalidObjectId,
    #[error("object doesn't end")]
    UnterminatedObject,
    #[error("missing reference ID pair")]
    MissingReferenceId,
    #[error("invalid reference ID pair")]
    InvalidReferenceId,
}

/// Reads objects composed from the lexer's tokens. Not a strict parser:
/// it accepts whatever sequence makes structural sense.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Parser {
            lexer: Lexer::new(data),
        }
    }

    /// Read an object at the lexer's position. `stack` holds the objects
    /// already collected at the current nesting level, so that `R` and
    /// `obj` can pop their two integer operands.
    pub fn parse(&mut self, stack: &mut Vec<PdfObject>) -> Result<PdfObject> {
        let token = self.lexer.next()?;
        match token {
            // Not significant to the object structure
            PdfObject::Newline | PdfObject::Comment(_) => self.parse(stack),
            PdfObject::BArray => {
                let mut array = Vec::new();
                loop {
                    match self.parse(&mut array)? {
                        PdfObject::End => return Err(Error::UnterminatedArray.into()),
                        PdfObject::EArray => break,
                        PdfObject::EDict => return Err(Error::StrayDictEnd.into()),
                        object => array.push(object),
                    }
                }
                Ok(PdfObject::Array(array))
            }
            PdfObject::BDict => {
                let mut items = Vec::new();
                loop {
                    match self.parse(&mut items)? {
                        PdfObject::End => return Err(Error::UnterminatedDict.into()),
                        PdfObject::EDict => break,
                        object => items.push(object),
                    }
                }
                if items.len() % 2 != 0 {
                    return Err(Error::UnbalancedDict.into());
                }
                let mut dict = Dict::new();
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    let PdfObject::Name(key) = key else {
                        return Err(Error::InvalidDictKey.into());
                    };
                    // The first occurrence of a key wins
                    dict.entry(key).or_insert(value);
                }
                Ok(PdfObject::Dict(dict))
            }
            PdfObject::Keyword(ref word) => match word.as_slice() {
                // TODO use the xref to read /Length etc. once such objects
                // need to be read; presumably the String variant can hold them
                b"stream" => Err(Error::StreamsUnsupported.into()),
                b"obj" => self.parse_indirect(stack),
                b"R" => Self::parse_reference(stack),
                _ => Ok(token),
            },
            token => Ok(token),
        }
    }

    fn parse_indirect(&mut self, stack: &mut Vec<PdfObject>) -> Result<PdfObject> {
        let (n, generation) =
            Self::pop_id_pair(stack, Error::MissingObjectId, Error::InvalidObjectId)?;

        let mut body = Vec::new();
        loop {
            match self.parse(&mut body)? {
                PdfObject::End => return Err(Error::UnterminatedObject.into()),
                PdfObject::Keyword(ref word) if word.as_slice() == b"endobj" => break,
                object => body.push(object),
            }
        }
        Ok(PdfObject::Indirect {
            n,
            generation,
            body,
        })
    }

    fn parse_reference(stack: &mut Vec<PdfObject>) -> Result<PdfObject> {
        let (n, generation) =
            Self::pop_id_pair(stack, Error::MissingReferenceId, Error::InvalidReferenceId)?;
        Ok(PdfObject::Reference { n, generation })
    }

    fn pop_id_pair(
        stack: &mut Vec<PdfObject>,
        missing: Error,
        invalid: Error,
    ) -> Result<(u32, u32)> {
        let generation = stack.pop();
        let n = stack.pop();
        let (Some(generation), Some(n)) = (generation, n) else {
            return Err(missing.into());
        };
        match (n.as_uint(), generation.as_uint()) {
            (Some(n), Some(generation)) => Ok((n, generation)),
            _ => Err(invalid.into()),
        }
    }
}
