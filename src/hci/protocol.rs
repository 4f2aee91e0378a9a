//! HCI command and event definitions used by the GAP layer.
//!
//! Commands and events are typed values; framing them into packets is the
//! transport's job. Opcodes, event codes and status codes follow the
//! Bluetooth Core specification, Vol 4, Part E.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
   address::BdAddr,
   error::{GapError, Result},
};

/// General/Unlimited Inquiry Access Code.
pub const GIAC: u32 = 0x9E8B33;
/// Maximum length of a remote or local device name.
pub const MAX_NAME_LENGTH: usize = 248;
/// Size of the extended inquiry response data block.
pub const EXTENDED_INQUIRY_RESPONSE_BYTES: usize = 240;
/// Largest name that fits into EIR data next to its length and type octets.
pub const EXTENDED_INQUIRY_RESPONSE_MAX_NAME_BYTES: usize = EXTENDED_INQUIRY_RESPONSE_BYTES - 2;

/// Connection handle assigned by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u16);

impl fmt::Display for ConnectionHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:#06x}", self.0)
   }
}

// === Opcodes ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpCode(pub u16);

impl OpCode {
   pub const fn new(ogf: u8, ocf: u16) -> Self {
      Self(((ogf as u16) << 10) | (ocf & 0x03FF))
   }

   pub const fn ogf(self) -> u8 {
      (self.0 >> 10) as u8
   }

   pub const fn ocf(self) -> u16 {
      self.0 & 0x03FF
   }

   pub const INQUIRY: Self = Self::new(0x01, 0x0001);
   pub const INQUIRY_CANCEL: Self = Self::new(0x01, 0x0002);
   pub const DISCONNECT: Self = Self::new(0x01, 0x0006);
   pub const REMOTE_NAME_REQUEST: Self = Self::new(0x01, 0x0019);
   pub const READ_REMOTE_SUPPORTED_FEATURES: Self = Self::new(0x01, 0x001B);
   pub const READ_REMOTE_EXTENDED_FEATURES: Self = Self::new(0x01, 0x001C);
   pub const READ_REMOTE_VERSION_INFO: Self = Self::new(0x01, 0x001D);
   pub const WRITE_LOCAL_NAME: Self = Self::new(0x03, 0x0013);
   pub const READ_SCAN_ENABLE: Self = Self::new(0x03, 0x0019);
   pub const WRITE_SCAN_ENABLE: Self = Self::new(0x03, 0x001A);
   pub const WRITE_INQUIRY_SCAN_ACTIVITY: Self = Self::new(0x03, 0x001E);
   pub const WRITE_INQUIRY_SCAN_TYPE: Self = Self::new(0x03, 0x0043);
   pub const WRITE_INQUIRY_MODE: Self = Self::new(0x03, 0x0045);
   pub const WRITE_EXTENDED_INQUIRY_RESPONSE: Self = Self::new(0x03, 0x0052);
   pub const LE_CONNECTION_UPDATE: Self = Self::new(0x08, 0x0013);
   pub const LE_READ_REMOTE_FEATURES: Self = Self::new(0x08, 0x0016);
}

impl fmt::Display for OpCode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:#06x} (ogf {:#04x}, ocf {:#06x})", self.0, self.ogf(), self.ocf())
   }
}

// === Event codes ===

/// Events the GAP layer consumes. LE meta subevents are flattened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum EventCode {
   InquiryComplete,
   InquiryResult,
   DisconnectionComplete,
   RemoteNameRequestComplete,
   ReadRemoteSupportedFeaturesComplete,
   ReadRemoteVersionInfoComplete,
   CommandComplete,
   CommandStatus,
   InquiryResultWithRssi,
   ReadRemoteExtendedFeaturesComplete,
   ExtendedInquiryResult,
   LeConnectionUpdateComplete,
   LeReadRemoteFeaturesComplete,
}

impl EventCode {
   /// Event code on the wire; LE subevents report the LE meta code.
   pub const fn raw(self) -> u8 {
      match self {
         Self::InquiryComplete => 0x01,
         Self::InquiryResult => 0x02,
         Self::DisconnectionComplete => 0x05,
         Self::RemoteNameRequestComplete => 0x07,
         Self::ReadRemoteSupportedFeaturesComplete => 0x0B,
         Self::ReadRemoteVersionInfoComplete => 0x0C,
         Self::CommandComplete => 0x0E,
         Self::CommandStatus => 0x0F,
         Self::InquiryResultWithRssi => 0x22,
         Self::ReadRemoteExtendedFeaturesComplete => 0x23,
         Self::ExtendedInquiryResult => 0x2F,
         Self::LeConnectionUpdateComplete | Self::LeReadRemoteFeaturesComplete => 0x3E,
      }
   }
}

// === Status codes ===

/// Controller error codes (Vol 1, Part F).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
pub enum StatusCode {
   Success = 0x00,
   UnknownCommand = 0x01,
   UnknownConnectionId = 0x02,
   HardwareFailure = 0x03,
   PageTimeout = 0x04,
   AuthenticationFailure = 0x05,
   PinOrKeyMissing = 0x06,
   MemoryCapacityExceeded = 0x07,
   ConnectionTimeout = 0x08,
   ConnectionLimitExceeded = 0x09,
   ConnectionAlreadyExists = 0x0B,
   CommandDisallowed = 0x0C,
   ConnectionRejectedLimitedResources = 0x0D,
   ConnectionAcceptTimeoutExceeded = 0x10,
   UnsupportedFeatureOrParameter = 0x11,
   InvalidHciCommandParameters = 0x12,
   RemoteUserTerminatedConnection = 0x13,
   ConnectionTerminatedByLocalHost = 0x16,
   UnsupportedRemoteFeature = 0x1A,
   UnspecifiedError = 0x1F,
   LmpResponseTimeout = 0x22,
   InstantPassed = 0x28,
   UnacceptableConnectionParameters = 0x3B,
   ConnectionFailedToBeEstablished = 0x3E,
}

impl StatusCode {
   /// Maps a raw status, folding codes this layer does not distinguish
   /// into `UnspecifiedError`.
   pub fn from_raw(raw: u8) -> Self {
      Self::from_repr(raw).unwrap_or(Self::UnspecifiedError)
   }

   pub const fn is_success(self) -> bool {
      matches!(self, Self::Success)
   }

   pub fn to_result(self) -> Result<()> {
      if self.is_success() {
         Ok(())
      } else {
         Err(GapError::Hci(self))
      }
   }
}

// === Parameters ===

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InquiryMode {
   Standard = 0x00,
   Rssi = 0x01,
   Extended = 0x02,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum InquiryScanType {
   Standard = 0x00,
   Interlaced = 0x01,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
pub enum PageScanRepetitionMode {
   #[default]
   R0 = 0x00,
   R1 = 0x01,
   R2 = 0x02,
}

/// Scan Enable bit field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanEnable(pub u8);

impl ScanEnable {
   pub const INQUIRY: u8 = 0x01;
   pub const PAGE: u8 = 0x02;

   pub const fn inquiry(self) -> bool {
      self.0 & Self::INQUIRY != 0
   }

   pub const fn page(self) -> bool {
      self.0 & Self::PAGE != 0
   }

   /// Returns a copy with the inquiry scan bit set or cleared.
   pub const fn with_inquiry(self, enabled: bool) -> Self {
      if enabled {
         Self(self.0 | Self::INQUIRY)
      } else {
         Self(self.0 & !Self::INQUIRY)
      }
   }
}

/// Parameters a connection is currently using.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeConnectionParameters {
   /// Connection interval in units of 1.25 ms.
   pub interval: u16,
   pub latency: u16,
   /// Supervision timeout in units of 10 ms.
   pub supervision_timeout: u16,
}

/// Parameters requested for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LePreferredConnectionParameters {
   pub min_interval: u16,
   pub max_interval: u16,
   pub max_latency: u16,
   pub supervision_timeout: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionInfo {
   pub lmp_version: u8,
   pub manufacturer: u16,
   pub lmp_subversion: u16,
}

/// One entry of an inquiry result event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryResponse {
   pub address: BdAddr,
   pub page_scan_repetition_mode: PageScanRepetitionMode,
   pub class_of_device: u32,
   pub clock_offset: u16,
   pub rssi: Option<i8>,
   pub eir: Option<Vec<u8>>,
}

impl InquiryResponse {
   pub fn new(address: BdAddr) -> Self {
      Self {
         address,
         page_scan_repetition_mode: PageScanRepetitionMode::R1,
         class_of_device: 0,
         clock_offset: 0,
         rssi: None,
         eir: None,
      }
   }
}

// === Commands ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
   Inquiry {
      lap: u32,
      inquiry_length: u8,
      num_responses: u8,
   },
   InquiryCancel,
   WriteInquiryMode(InquiryMode),
   RemoteNameRequest {
      address: BdAddr,
      page_scan_repetition_mode: PageScanRepetitionMode,
      clock_offset: u16,
   },
   ReadScanEnable,
   WriteScanEnable(ScanEnable),
   WriteInquiryScanActivity {
      interval: u16,
      window: u16,
   },
   WriteInquiryScanType(InquiryScanType),
   WriteLocalName(Vec<u8>),
   WriteExtendedInquiryResponse {
      fec_required: bool,
      data: heapless::Vec<u8, EXTENDED_INQUIRY_RESPONSE_BYTES>,
   },
   Disconnect {
      handle: ConnectionHandle,
      reason: StatusCode,
   },
   LeConnectionUpdate {
      handle: ConnectionHandle,
      params: LePreferredConnectionParameters,
   },
   ReadRemoteVersionInfo(ConnectionHandle),
   ReadRemoteSupportedFeatures(ConnectionHandle),
   ReadRemoteExtendedFeatures {
      handle: ConnectionHandle,
      page: u8,
   },
   LeReadRemoteFeatures(ConnectionHandle),
}

impl Command {
   pub const fn opcode(&self) -> OpCode {
      match self {
         Self::Inquiry { .. } => OpCode::INQUIRY,
         Self::InquiryCancel => OpCode::INQUIRY_CANCEL,
         Self::WriteInquiryMode(_) => OpCode::WRITE_INQUIRY_MODE,
         Self::RemoteNameRequest { .. } => OpCode::REMOTE_NAME_REQUEST,
         Self::ReadScanEnable => OpCode::READ_SCAN_ENABLE,
         Self::WriteScanEnable(_) => OpCode::WRITE_SCAN_ENABLE,
         Self::WriteInquiryScanActivity { .. } => OpCode::WRITE_INQUIRY_SCAN_ACTIVITY,
         Self::WriteInquiryScanType(_) => OpCode::WRITE_INQUIRY_SCAN_TYPE,
         Self::WriteLocalName(_) => OpCode::WRITE_LOCAL_NAME,
         Self::WriteExtendedInquiryResponse { .. } => OpCode::WRITE_EXTENDED_INQUIRY_RESPONSE,
         Self::Disconnect { .. } => OpCode::DISCONNECT,
         Self::LeConnectionUpdate { .. } => OpCode::LE_CONNECTION_UPDATE,
         Self::ReadRemoteVersionInfo(_) => OpCode::READ_REMOTE_VERSION_INFO,
         Self::ReadRemoteSupportedFeatures(_) => OpCode::READ_REMOTE_SUPPORTED_FEATURES,
         Self::ReadRemoteExtendedFeatures { .. } => OpCode::READ_REMOTE_EXTENDED_FEATURES,
         Self::LeReadRemoteFeatures(_) => OpCode::LE_READ_REMOTE_FEATURES,
      }
   }

   /// Event that ends this command's transaction.
   ///
   /// Disconnect and LE Connection Update finish with their command status;
   /// their completion events are delivered to event handlers instead.
   pub const fn completion_event(&self) -> EventCode {
      match self {
         Self::Inquiry { .. } => EventCode::InquiryComplete,
         Self::RemoteNameRequest { .. } => EventCode::RemoteNameRequestComplete,
         Self::ReadRemoteVersionInfo(_) => EventCode::ReadRemoteVersionInfoComplete,
         Self::ReadRemoteSupportedFeatures(_) => EventCode::ReadRemoteSupportedFeaturesComplete,
         Self::ReadRemoteExtendedFeatures { .. } => EventCode::ReadRemoteExtendedFeaturesComplete,
         Self::LeReadRemoteFeatures(_) => EventCode::LeReadRemoteFeaturesComplete,
         Self::Disconnect { .. } | Self::LeConnectionUpdate { .. } => EventCode::CommandStatus,
         _ => EventCode::CommandComplete,
      }
   }
}

// === Events ===

/// Return parameters of a Command Complete event, beyond the status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReturnParams {
   #[default]
   None,
   ScanEnable(ScanEnable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
   CommandComplete {
      opcode: OpCode,
      status: StatusCode,
      params: ReturnParams,
   },
   CommandStatus {
      opcode: OpCode,
      status: StatusCode,
   },
   InquiryComplete {
      status: StatusCode,
   },
   InquiryResult(Vec<InquiryResponse>),
   InquiryResultWithRssi(Vec<InquiryResponse>),
   ExtendedInquiryResult(InquiryResponse),
   RemoteNameRequestComplete {
      status: StatusCode,
      address: BdAddr,
      name: Vec<u8>,
   },
   ReadRemoteVersionInfoComplete {
      status: StatusCode,
      handle: ConnectionHandle,
      version: VersionInfo,
   },
   ReadRemoteSupportedFeaturesComplete {
      status: StatusCode,
      handle: ConnectionHandle,
      features: u64,
   },
   ReadRemoteExtendedFeaturesComplete {
      status: StatusCode,
      handle: ConnectionHandle,
      page: u8,
      max_page: u8,
      features: u64,
   },
   LeReadRemoteFeaturesComplete {
      status: StatusCode,
      handle: ConnectionHandle,
      features: u64,
   },
   LeConnectionUpdateComplete {
      status: StatusCode,
      handle: ConnectionHandle,
      params: LeConnectionParameters,
   },
   DisconnectionComplete {
      status: StatusCode,
      handle: ConnectionHandle,
      reason: StatusCode,
   },
}

impl Event {
   pub const fn code(&self) -> EventCode {
      match self {
         Self::CommandComplete { .. } => EventCode::CommandComplete,
         Self::CommandStatus { .. } => EventCode::CommandStatus,
         Self::InquiryComplete { .. } => EventCode::InquiryComplete,
         Self::InquiryResult(_) => EventCode::InquiryResult,
         Self::InquiryResultWithRssi(_) => EventCode::InquiryResultWithRssi,
         Self::ExtendedInquiryResult(_) => EventCode::ExtendedInquiryResult,
         Self::RemoteNameRequestComplete { .. } => EventCode::RemoteNameRequestComplete,
         Self::ReadRemoteVersionInfoComplete { .. } => EventCode::ReadRemoteVersionInfoComplete,
         Self::ReadRemoteSupportedFeaturesComplete { .. } => {
            EventCode::ReadRemoteSupportedFeaturesComplete
         },
         Self::ReadRemoteExtendedFeaturesComplete { .. } => {
            EventCode::ReadRemoteExtendedFeaturesComplete
         },
         Self::LeReadRemoteFeaturesComplete { .. } => EventCode::LeReadRemoteFeaturesComplete,
         Self::LeConnectionUpdateComplete { .. } => EventCode::LeConnectionUpdateComplete,
         Self::DisconnectionComplete { .. } => EventCode::DisconnectionComplete,
      }
   }

   /// Status carried by the event; result events carry none and report success.
   pub const fn status(&self) -> StatusCode {
      match self {
         Self::CommandComplete { status, .. }
         | Self::CommandStatus { status, .. }
         | Self::InquiryComplete { status }
         | Self::RemoteNameRequestComplete { status, .. }
         | Self::ReadRemoteVersionInfoComplete { status, .. }
         | Self::ReadRemoteSupportedFeaturesComplete { status, .. }
         | Self::ReadRemoteExtendedFeaturesComplete { status, .. }
         | Self::LeReadRemoteFeaturesComplete { status, .. }
         | Self::LeConnectionUpdateComplete { status, .. }
         | Self::DisconnectionComplete { status, .. } => *status,
         Self::InquiryResult(_)
         | Self::InquiryResultWithRssi(_)
         | Self::ExtendedInquiryResult(_) => StatusCode::Success,
      }
   }

   /// Shorthand for a successful Command Complete without return parameters.
   pub const fn command_complete(opcode: OpCode) -> Self {
      Self::CommandComplete {
         opcode,
         status: StatusCode::Success,
         params: ReturnParams::None,
      }
   }

   pub const fn command_status(opcode: OpCode, status: StatusCode) -> Self {
      Self::CommandStatus { opcode, status }
   }
}

/// Truncates a name at its first NUL and at [`MAX_NAME_LENGTH`].
pub fn trim_name(raw: &[u8]) -> &[u8] {
   let raw = &raw[..raw.len().min(MAX_NAME_LENGTH)];
   let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
   &raw[..end]
}
