use std::{collections::HashMap, fmt};

use thiserror::Error;

type IndexOfError = usize;

// nesting deeper than this is never produced by real clients
const MAX_NESTING_DEPTH: usize = 64;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ErrorElem {
    Unknown,
    Str,
    Int,
    List,
    Dict,
}

#[derive(PartialEq, Debug, Error)]
#[error("malformed bencoded {elem:?} at byte {index}")]
pub struct ParseError {
    elem: ErrorElem,
    index: IndexOfError,
}

impl ParseError {
    fn new(elem: ErrorElem, index: IndexOfError) -> Self {
        ParseError { elem, index }
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum Value {
    Str(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(HashMap<Vec<u8>, Value>, usize, usize), // entries, start and end (exclusive) byte position in the source
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "\"{}\"", String::from_utf8_lossy(s)),
            Value::Int(i) => write!(f, "{i}"),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Dict(d, _, _) => {
                let mut keys: Vec<&Vec<u8>> = d.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", String::from_utf8_lossy(k), d[*k])?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl Value {
    /// Builds a dictionary value that does not come from a parsed source.
    pub fn dict(entries: HashMap<Vec<u8>, Value>) -> Self {
        Value::Dict(entries, 0, 0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Str(s) => encode_string(s, out),
            Value::Int(i) => out.extend_from_slice(format!("i{i}e").as_bytes()),
            Value::List(l) => {
                out.push(b'l');
                l.iter().for_each(|v| v.encode_into(out));
                out.push(b'e');
            }
            Value::Dict(d, _, _) => {
                // keys must appear sorted as raw strings
                let mut keys: Vec<&Vec<u8>> = d.keys().collect();
                keys.sort();
                out.push(b'd');
                for k in keys {
                    encode_string(k, out);
                    d[k].encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn new(source: &[u8]) -> Result<Self, ParseError> {
        let (value, size) = Self::new_with_size(source)?;
        if size != source.len() {
            return Err(ParseError::new(ErrorElem::Unknown, size));
        }
        Ok(value)
    }

    /// Decodes the first value in `source`, returning it along with the number of bytes it used.
    /// Trailing bytes are left to the caller (e.g. raw data following an ut_metadata dict).
    pub fn new_with_size(source: &[u8]) -> Result<(Self, usize), ParseError> {
        Self::from_bytes(source, 0, 0)
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(d, _, _) => d.get(key),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    // source is the source data
    // index is where to look from the source
    // return Value, index of next byte to read
    fn from_bytes(source: &[u8], index: usize, depth: usize) -> Result<(Self, usize), ParseError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ParseError::new(ErrorElem::Unknown, index));
        }
        match source.get(index) {
            Some(b'0'..=b'9') => Value::parse_str(source, index),
            Some(b'i') => Value::parse_int(source, index),
            Some(b'l') => Value::parse_list(source, index, depth),
            Some(b'd') => Value::parse_dict(source, index, depth),
            _ => Err(ParseError::new(ErrorElem::Unknown, index)),
        }
    }

    fn parse_str(source: &[u8], index: usize) -> Result<(Self, usize), ParseError> {
        let start_string_len_index = index;
        let mut index = index;
        loop {
            match source.get(index) {
                Some(b'0'..=b'9') => index += 1,
                Some(b':') => break,
                _ => return Err(ParseError::new(ErrorElem::Str, index)),
            }
        }
        let string_len = std::str::from_utf8(&source[start_string_len_index..index])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(ParseError::new(ErrorElem::Str, start_string_len_index))?;
        index += 1; // skip ':'
        let end_string_index = index
            .checked_add(string_len)
            .filter(|end| *end <= source.len())
            .ok_or(ParseError::new(ErrorElem::Str, start_string_len_index))?;
        Ok((
            Value::Str(source[index..end_string_index].to_vec()),
            end_string_index,
        ))
    }

    fn parse_int(source: &[u8], index: usize) -> Result<(Self, usize), ParseError> {
        let start_int_index = index + 1;
        let mut index = start_int_index;
        loop {
            match source.get(index) {
                Some(b'0'..=b'9' | b'-') => index += 1,
                Some(b'e') => break,
                _ => return Err(ParseError::new(ErrorElem::Int, index)),
            }
        }
        let int_str = std::str::from_utf8(&source[start_int_index..index])
            .map_err(|_| ParseError::new(ErrorElem::Int, start_int_index))?;

        // check invalid
        if int_str.is_empty()
            || int_str == "-0"
            || (int_str.starts_with('0') && int_str.len() > 1)
            || int_str.starts_with("-0")
        {
            return Err(ParseError::new(ErrorElem::Int, start_int_index));
        }

        match int_str.parse::<i64>() {
            Ok(int_val) => Ok((Value::Int(int_val), index + 1)),
            Err(_) => Err(ParseError::new(ErrorElem::Int, start_int_index)),
        }
    }

    fn parse_list(source: &[u8], index: usize, depth: usize) -> Result<(Self, usize), ParseError> {
        let mut l = Vec::new();
        let mut index = index + 1;
        loop {
            match source.get(index) {
                None => return Err(ParseError::new(ErrorElem::List, index)),
                Some(b'e') => {
                    index += 1;
                    break;
                }
                _ => {
                    let (v, new_index) = Self::from_bytes(source, index, depth + 1)?;
                    index = new_index;
                    l.push(v);
                }
            }
        }
        Ok((Value::List(l), index))
    }

    fn parse_dict(source: &[u8], index: usize, depth: usize) -> Result<(Self, usize), ParseError> {
        let start = index;
        let mut d = HashMap::new();
        let mut index = index + 1;
        loop {
            match source.get(index) {
                None => return Err(ParseError::new(ErrorElem::Dict, index)),
                Some(b'e') => {
                    index += 1;
                    break;
                }
                Some(b'0'..=b'9') => {
                    let (k, new_index) = Self::parse_str(source, index)?;
                    let k = match k {
                        Value::Str(k) => k,
                        _ => return Err(ParseError::new(ErrorElem::Dict, index)),
                    };
                    let (v, new_index) = Self::from_bytes(source, new_index, depth + 1)?;
                    index = new_index;
                    d.insert(k, v);
                }
                _ => return Err(ParseError::new(ErrorElem::Dict, index)),
            }
        }
        Ok((Value::Dict(d, start, index), index))
    }
}

fn encode_string(s: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(s.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(s);
}

#[cfg(test)]
mod tests {
    use super::{ErrorElem, ParseError, Value};
    use std::collections::HashMap;

    #[test]
    fn encode_value() {
        let val_l = Value::List(vec![
            Value::dict(HashMap::from([(b"k1".to_vec(), Value::Int(1))])),
            Value::Int(2),
            Value::Int(3),
            Value::Str(b"bye".to_vec()),
        ]);
        assert_eq!(b"ld2:k1i1eei2ei3e3:byee".to_vec(), val_l.encode());
    }

    #[test]
    fn encode_dict_sorts_keys() {
        let val = Value::dict(HashMap::from([
            (b"piece".to_vec(), Value::Int(0)),
            (b"msg_type".to_vec(), Value::Int(1)),
            (b"total_size".to_vec(), Value::Int(3)),
        ]));
        assert_eq!(
            b"d8:msg_typei1e5:piecei0e10:total_sizei3ee".to_vec(),
            val.encode()
        );
    }

    #[test]
    fn decode_int() {
        assert_eq!(Value::new(b"i2e"), Ok(Value::Int(2)));
        assert_eq!(Value::new(b"i-2312e"), Ok(Value::Int(-2312)));
        assert_eq!(Value::new(b"i0e"), Ok(Value::Int(0)));
        assert_eq!(
            Value::new(b"i-0e"),
            Err(ParseError {
                elem: ErrorElem::Int,
                index: 1
            })
        );
        assert_eq!(
            Value::new(b"i01e"),
            Err(ParseError {
                elem: ErrorElem::Int,
                index: 1
            })
        );
        assert!(Value::new(b"ie").is_err());
    }

    #[test]
    fn decode_str() {
        assert_eq!(Value::new(b"5:hello"), Ok(Value::Str(b"hello".to_vec())));
        assert_eq!(Value::new(b"0:"), Ok(Value::Str(Vec::new())));
        assert_eq!(
            Value::new(b"6:hello"),
            Err(ParseError {
                elem: ErrorElem::Str,
                index: 0
            })
        );
    }

    #[test]
    fn decode_binary_str() {
        assert_eq!(
            Value::new(&[b'2', b':', 0xff, 0x00]),
            Ok(Value::Str(vec![0xff, 0x00]))
        );
    }

    #[test]
    fn decode_list() {
        let val_l = Value::List(vec![Value::Int(2), Value::Int(3), Value::Int(-3)]);
        assert_eq!(Value::new(b"li2ei3ei-3ee"), Ok(val_l));
    }

    #[test]
    fn decode_dict_with_span() {
        let source = b"d4:infod6:lengthi5ee3:fooi1ee";
        let value = Value::new(source).unwrap();
        match value.get(b"info") {
            Some(Value::Dict(_, start, end)) => {
                assert_eq!(&source[*start..*end], b"d6:lengthi5ee");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(value.get(b"foo"), Some(&Value::Int(1)));
    }

    #[test]
    fn decode_with_trailing_data() {
        let source = b"d8:msg_typei1e5:piecei0eeRAWDATA";
        let (value, size) = Value::new_with_size(source).unwrap();
        assert_eq!(value.get(b"msg_type"), Some(&Value::Int(1)));
        assert_eq!(&source[size..], b"RAWDATA");
        // the strict variant refuses trailing bytes
        assert!(Value::new(source).is_err());
    }

    #[test]
    fn decode_truncated() {
        assert!(Value::new(b"d3:fooi1e").is_err());
        assert!(Value::new(b"l").is_err());
        assert!(Value::new(b"di1ei2ee").is_err());
    }
}
