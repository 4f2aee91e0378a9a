//! Bluetooth device addresses.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 48-bit Bluetooth device address, stored most significant byte first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
   pub const fn new(bytes: [u8; 6]) -> Self {
      Self(bytes)
   }

   pub const fn bytes(&self) -> [u8; 6] {
      self.0
   }
}

impl fmt::Display for BdAddr {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseAddressError {
   #[error("address must have 6 octets, got {0}")]
   InvalidLength(usize),

   #[error("invalid octet {0:?}")]
   InvalidOctet(String),
}

impl FromStr for BdAddr {
   type Err = ParseAddressError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let octets: Vec<&str> = s.split(':').collect();
      if octets.len() != 6 {
         return Err(ParseAddressError::InvalidLength(octets.len()));
      }

      let mut bytes = [0u8; 6];
      for (byte, octet) in bytes.iter_mut().zip(octets) {
         if octet.len() != 2 {
            return Err(ParseAddressError::InvalidOctet(octet.to_string()));
         }
         *byte = u8::from_str_radix(octet, 16)
            .map_err(|_| ParseAddressError::InvalidOctet(octet.to_string()))?;
      }
      Ok(Self(bytes))
   }
}

/// Transport and address kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum AddressType {
   #[strum(serialize = "br/edr")]
   BrEdr,
   #[strum(serialize = "le-public")]
   LePublic,
   #[strum(serialize = "le-random")]
   LeRandom,
}

/// Address plus the transport it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
   pub kind: AddressType,
   pub value: BdAddr,
}

impl DeviceAddress {
   pub const fn new(kind: AddressType, value: BdAddr) -> Self {
      Self { kind, value }
   }

   pub const fn bredr(value: BdAddr) -> Self {
      Self::new(AddressType::BrEdr, value)
   }

   pub const fn is_le(&self) -> bool {
      !matches!(self.kind, AddressType::BrEdr)
   }
}

impl fmt::Display for DeviceAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} ({})", self.value, self.kind)
   }
}
