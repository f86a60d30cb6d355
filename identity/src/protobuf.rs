// Copyright (c) 2024 Botho Foundation

//! A lightweight protobuf reader/writer supporting only wire-type 2
//! (length-delimited), the only wire type the envelope and Plaintext
//! handshake payloads in this workspace need.

use crate::{error::IdentityError, varint};

const WIRE_TYPE_LENGTH_DELIMITED: u64 = 2;

/// One decoded length-delimited field: `(field_number, bytes)`.
pub type Field = (u32, Vec<u8>);

/// Append a length-delimited field `field_number: bytes` to `out`.
pub fn write_field(field_number: u32, bytes: &[u8], out: &mut Vec<u8>) {
    let tag = ((field_number as u64) << 3) | WIRE_TYPE_LENGTH_DELIMITED;
    varint::encode(tag, out);
    varint::encode(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Parse every top-level field out of `input`.
///
/// Rejects any field whose wire type is not length-delimited, any
/// truncated field, and any field whose declared length exceeds
/// `max_field_size`.
pub fn parse_fields(input: &[u8], max_field_size: usize) -> Result<Vec<Field>, IdentityError> {
    let mut fields = Vec::new();
    let mut offset = 0;
    while offset < input.len() {
        let (tag, tag_size) = varint::decode(&input[offset..])?;
        offset += tag_size;
        let wire_type = tag & 0x7;
        let field_number = (tag >> 3) as u32;
        if wire_type != WIRE_TYPE_LENGTH_DELIMITED {
            return Err(IdentityError::InvalidWireType);
        }
        let (len, len_size) = varint::decode(&input[offset..])?;
        offset += len_size;
        let len = len as usize;
        if len > max_field_size {
            return Err(IdentityError::FieldTooLarge);
        }
        if input.len() < offset + len {
            return Err(IdentityError::ProtobufTruncated);
        }
        fields.push((field_number, input[offset..offset + len].to_vec()));
        offset += len;
    }
    Ok(fields)
}

/// Convenience: find the first field with the given number.
pub fn find_field(fields: &[Field], field_number: u32) -> Option<&[u8]> {
    fields
        .iter()
        .find(|(n, _)| *n == field_number)
        .map(|(_, bytes)| bytes.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_two_fields() {
        let mut buf = Vec::new();
        write_field(1, b"hello", &mut buf);
        write_field(2, b"world", &mut buf);

        let fields = parse_fields(&buf, 1024).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(find_field(&fields, 1), Some(&b"hello"[..]));
        assert_eq!(find_field(&fields, 2), Some(&b"world"[..]));
    }

    #[test]
    fn rejects_non_length_delimited_wire_type() {
        // tag with field=1, wire_type=0 (varint)
        let mut buf = Vec::new();
        varint::encode(1u64 << 3, &mut buf);
        varint::encode(5, &mut buf); // a varint value, not a length prefix
        assert_eq!(
            parse_fields(&buf, 1024).unwrap_err(),
            IdentityError::InvalidWireType
        );
    }

    #[test]
    fn rejects_truncated_field() {
        let mut buf = Vec::new();
        write_field(1, b"hello", &mut buf);
        buf.truncate(buf.len() - 2);
        assert_eq!(
            parse_fields(&buf, 1024).unwrap_err(),
            IdentityError::ProtobufTruncated
        );
    }

    #[test]
    fn rejects_oversize_field() {
        let mut buf = Vec::new();
        write_field(1, &[0u8; 100], &mut buf);
        assert_eq!(
            parse_fields(&buf, 10).unwrap_err(),
            IdentityError::FieldTooLarge
        );
    }
}
