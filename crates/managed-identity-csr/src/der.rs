//! Minimal ASN.1 DER writer
//!
//! Only the universal types a PKCS#10 request needs are covered. Every
//! function returns a complete TLV so callers compose structures by nesting
//! calls, e.g. `sequence(&[&integer(&[0]), &null()])`.

use crate::error::CsrError;

/// Universal and context-specific tags used by the encoder.
pub mod tag {
    /// INTEGER
    pub const INTEGER: u8 = 0x02;
    /// BIT STRING
    pub const BIT_STRING: u8 = 0x03;
    /// NULL
    pub const NULL: u8 = 0x05;
    /// OBJECT IDENTIFIER
    pub const OBJECT_IDENTIFIER: u8 = 0x06;
    /// UTF8String
    pub const UTF8_STRING: u8 = 0x0C;
    /// PrintableString
    pub const PRINTABLE_STRING: u8 = 0x13;
    /// SEQUENCE (constructed)
    pub const SEQUENCE: u8 = 0x30;
    /// SET (constructed)
    pub const SET: u8 = 0x31;
    /// `[0]` constructed, context-specific
    pub const CONTEXT_CONSTRUCTED_0: u8 = 0xA0;
}

/// Encode a definite length: short form below 0x80, long form otherwise.
pub fn encode_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }

    let bytes = len.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    let significant = &bytes[first..];

    let mut out = Vec::with_capacity(significant.len() + 1);
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
    out
}

/// Wrap `content` in a tag-length-value triple.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let length = encode_length(content.len());
    let mut out = Vec::with_capacity(1 + length.len() + content.len());
    out.push(tag);
    out.extend_from_slice(&length);
    out.extend_from_slice(content);
    out
}

fn constructed(tag: u8, parts: &[&[u8]]) -> Vec<u8> {
    let content: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
    tlv(tag, &content)
}

/// SEQUENCE of already-encoded elements, in order.
pub fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    constructed(tag::SEQUENCE, parts)
}

/// SET of already-encoded elements.
///
/// Elements are written in the order given. Every SET in a CSR holds a
/// single element, so DER's sorted-SET-OF rule is trivially satisfied.
pub fn set(parts: &[&[u8]]) -> Vec<u8> {
    constructed(tag::SET, parts)
}

/// Context-specific constructed tag `[0]` wrapping the raw concatenation of `parts`.
pub fn context_specific_constructed(parts: &[&[u8]]) -> Vec<u8> {
    constructed(tag::CONTEXT_CONSTRUCTED_0, parts)
}

/// Unsigned big-endian INTEGER.
///
/// Redundant leading zero octets are stripped, and a single 0x00 is
/// prepended when the high bit of the first octet is set so the value
/// stays positive.
pub fn integer(unsigned_be: &[u8]) -> Vec<u8> {
    let first = unsigned_be
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(unsigned_be.len());
    let trimmed = &unsigned_be[first..];

    let mut content = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.is_empty() || trimmed[0] & 0x80 != 0 {
        content.push(0x00);
    }
    content.extend_from_slice(trimmed);
    tlv(tag::INTEGER, &content)
}

/// BIT STRING with zero unused bits.
pub fn bit_string(bytes: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(bytes.len() + 1);
    content.push(0x00);
    content.extend_from_slice(bytes);
    tlv(tag::BIT_STRING, &content)
}

/// NULL
pub fn null() -> Vec<u8> {
    vec![tag::NULL, 0x00]
}

/// UTF8String
pub fn utf8_string(value: &str) -> Vec<u8> {
    tlv(tag::UTF8_STRING, value.as_bytes())
}

/// PrintableString.
///
/// The bytes are written as given. The CUID attribute carries JSON in this
/// type, which certificate authorities accept even though `"`, `{` and `:`
/// fall outside the strict PrintableString alphabet.
pub fn printable_string(value: &str) -> Vec<u8> {
    tlv(tag::PRINTABLE_STRING, value.as_bytes())
}

/// OBJECT IDENTIFIER from its arcs.
///
/// # Errors
///
/// Returns [`CsrError::InvalidObjectIdentifier`] when fewer than two arcs
/// are given or the first two arcs are out of range.
pub fn object_identifier(arcs: &[u64]) -> Result<Vec<u8>, CsrError> {
    let [first, second, rest @ ..] = arcs else {
        return Err(CsrError::InvalidObjectIdentifier(format!("{arcs:?}")));
    };
    if *first > 2 || (*first < 2 && *second >= 40) {
        return Err(CsrError::InvalidObjectIdentifier(format!("{arcs:?}")));
    }

    let mut content = Vec::new();
    push_base128(&mut content, first * 40 + second);
    for arc in rest {
        push_base128(&mut content, *arc);
    }
    Ok(tlv(tag::OBJECT_IDENTIFIER, &content))
}

fn push_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = [0u8; 10];
    let mut count = 0;
    loop {
        groups[count] = (value & 0x7F) as u8;
        count += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for i in (0..count).rev() {
        let continuation = if i == 0 { 0x00 } else { 0x80 };
        out.push(groups[i] | continuation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_short_and_long_form_lengths() {
        assert_eq!(encode_length(0), vec![0x00]);
        assert_eq!(encode_length(0x7F), vec![0x7F]);
        assert_eq!(encode_length(0x80), vec![0x81, 0x80]);
        assert_eq!(encode_length(0xFF), vec![0x81, 0xFF]);
        assert_eq!(encode_length(0x100), vec![0x82, 0x01, 0x00]);
        assert_eq!(encode_length(0x010000), vec![0x83, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_integer_padding() {
        assert_eq!(integer(&[0x00]), vec![0x02, 0x01, 0x00]);
        assert_eq!(integer(&[]), vec![0x02, 0x01, 0x00]);
        assert_eq!(integer(&[0x7F]), vec![0x02, 0x01, 0x7F]);
        // High bit set: must stay unsigned
        assert_eq!(integer(&[0x80]), vec![0x02, 0x02, 0x00, 0x80]);
        // Leading zeros are not significant
        assert_eq!(integer(&[0x00, 0x00, 0x01, 0x00]), vec![0x02, 0x02, 0x01, 0x00]);
        // RSA public exponent 65537
        assert_eq!(integer(&[0x01, 0x00, 0x01]), vec![0x02, 0x03, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_known_object_identifiers() {
        // rsaEncryption
        assert_eq!(
            object_identifier(&[1, 2, 840, 113549, 1, 1, 1]).unwrap(),
            vec![0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01]
        );
        // commonName
        assert_eq!(object_identifier(&[2, 5, 4, 3]).unwrap(), vec![0x06, 0x03, 0x55, 0x04, 0x03]);
        // domainComponent, first arc 0
        assert_eq!(
            object_identifier(&[0, 9, 2342, 19200300, 100, 1, 25]).unwrap(),
            vec![0x06, 0x0A, 0x09, 0x92, 0x26, 0x89, 0x93, 0xF2, 0x2C, 0x64, 0x01, 0x19]
        );
    }

    #[test]
    fn test_invalid_object_identifiers() {
        assert!(object_identifier(&[1]).is_err());
        assert!(object_identifier(&[3, 1]).is_err());
        assert!(object_identifier(&[1, 40]).is_err());
    }

    #[test]
    fn test_bit_string_and_null() {
        assert_eq!(bit_string(&[0xAB]), vec![0x03, 0x02, 0x00, 0xAB]);
        assert_eq!(null(), vec![0x05, 0x00]);
    }

    #[test]
    fn test_strings() {
        assert_eq!(utf8_string("ab"), vec![0x0C, 0x02, b'a', b'b']);
        assert_eq!(printable_string("{}"), vec![0x13, 0x02, b'{', b'}']);
    }

    #[test]
    fn test_constructed_types_concatenate_in_order() {
        let a = integer(&[1]);
        let b = null();
        assert_eq!(
            sequence(&[&a, &b]),
            vec![0x30, 0x05, 0x02, 0x01, 0x01, 0x05, 0x00]
        );
        assert_eq!(set(&[&b]), vec![0x31, 0x02, 0x05, 0x00]);
        assert_eq!(
            context_specific_constructed(&[&b, &b]),
            vec![0xA0, 0x04, 0x05, 0x00, 0x05, 0x00]
        );
    }

    #[test]
    fn test_long_content_uses_long_form() {
        let content = vec![0x41; 300];
        let encoded = tlv(tag::UTF8_STRING, &content);
        assert_eq!(&encoded[..4], &[0x0C, 0x82, 0x01, 0x2C]);
        assert_eq!(encoded.len(), 304);
    }
}
