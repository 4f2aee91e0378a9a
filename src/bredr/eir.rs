//! Extended inquiry response data.
//!
//! EIR data is a sequence of `[length, type, payload...]` structures padded
//! with zeros to 240 bytes. Only the local name structures matter here.

use crate::hci::{EXTENDED_INQUIRY_RESPONSE_BYTES, EXTENDED_INQUIRY_RESPONSE_MAX_NAME_BYTES};

pub type EirData = heapless::Vec<u8, EXTENDED_INQUIRY_RESPONSE_BYTES>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
pub enum DataType {
   ShortenedLocalName = 0x08,
   CompleteLocalName = 0x09,
}

/// Builds the EIR block advertising `name`.
pub fn local_name_response(name: &str) -> EirData {
   let bytes = name.as_bytes();
   let (data_type, len) = if bytes.len() >= EXTENDED_INQUIRY_RESPONSE_MAX_NAME_BYTES {
      (DataType::ShortenedLocalName, EXTENDED_INQUIRY_RESPONSE_MAX_NAME_BYTES)
   } else {
      (DataType::CompleteLocalName, bytes.len())
   };

   let mut eir = EirData::new();
   // The length octet covers the type octet and the payload.
   let written = eir
      .extend_from_slice(&[len as u8 + 1, data_type as u8])
      .and_then(|()| eir.extend_from_slice(&bytes[..len]))
      .and_then(|()| eir.resize(EXTENDED_INQUIRY_RESPONSE_BYTES, 0));
   debug_assert!(written.is_ok());
   eir
}

/// Finds the local name in EIR data, preferring the complete name.
pub fn parse_local_name(data: &[u8]) -> Option<&[u8]> {
   let mut shortened = None;
   let mut rest = data;
   while let [len, tail @ ..] = rest {
      let len = *len as usize;
      if len == 0 || len > tail.len() {
         break;
      }
      let (field, next) = tail.split_at(len);
      match DataType::from_repr(field[0]) {
         Some(DataType::CompleteLocalName) => return Some(&field[1..]),
         Some(DataType::ShortenedLocalName) => shortened = Some(&field[1..]),
         None => {},
      }
      rest = next;
   }
   shortened
}
