//! Peer records and the shared peer cache.
//!
//! The cache is the store both managers write discovery, naming,
//! interrogation and connection state into. Lookups hand out snapshots;
//! mutation goes through [`PeerCache::update`].

use std::{collections::HashMap, fmt, sync::Arc};

use log::{debug, trace};
use parking_lot::Mutex;
use rand::Rng;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{
   address::DeviceAddress,
   hci::{
      InquiryResponse, LeConnectionParameters, LePreferredConnectionParameters,
      PageScanRepetitionMode, VersionInfo, trim_name,
   },
};

/// Opaque identifier of a cached peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:016x}", self.0)
   }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
   #[default]
   NotConnected,
   Initializing,
   Connected,
}

// === Features ===

/// LMP feature pages learned through interrogation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LmpFeatures {
   pages: SmallVec<[Option<u64>; 3]>,
   last_page_number: u8,
}

impl LmpFeatures {
   /// Page 0 bit signalling that extended feature pages exist.
   pub const EXTENDED_FEATURES_BIT: u8 = 63;

   pub fn set_page(&mut self, page: u8, bits: u64) {
      let index = page as usize;
      if self.pages.len() <= index {
         self.pages.resize(index + 1, None);
      }
      self.pages[index] = Some(bits);
   }

   pub fn page(&self, page: u8) -> Option<u64> {
      self.pages.get(page as usize).copied().flatten()
   }

   pub fn has_page(&self, page: u8) -> bool {
      self.page(page).is_some()
   }

   pub fn has_bit(&self, page: u8, bit: u8) -> bool {
      self.page(page).is_some_and(|bits| bits & (1 << bit) != 0)
   }

   pub const fn last_page_number(&self) -> u8 {
      self.last_page_number
   }

   pub fn set_last_page_number(&mut self, page: u8) {
      self.last_page_number = page;
   }

   pub fn supports_extended_features(&self) -> bool {
      self.has_bit(0, Self::EXTENDED_FEATURES_BIT)
   }
}

/// LE feature bit for the connection parameters request procedure.
pub const LE_FEATURE_CONNECTION_PARAMETERS_REQUEST: u8 = 1;

// === Transport data ===

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrEdrData {
   pub page_scan_repetition_mode: PageScanRepetitionMode,
   pub clock_offset: u16,
   pub class_of_device: u32,
   pub rssi: Option<i8>,
   pub eir: Option<Vec<u8>>,
   pub connection_state: ConnectionState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeData {
   pub connection_state: ConnectionState,
   pub connection_parameters: Option<LeConnectionParameters>,
   pub preferred_parameters: Option<LePreferredConnectionParameters>,
   pub features: Option<u64>,
   pub bonded: bool,
}

impl LeData {
   pub fn supports(&self, bit: u8) -> bool {
      self.features.is_some_and(|bits| bits & (1 << bit) != 0)
   }
}

// === Peer ===

#[derive(Debug, Clone)]
pub struct Peer {
   pub id: PeerId,
   pub address: DeviceAddress,
   pub connectable: bool,
   pub temporary: bool,
   pub name: Option<SmolStr>,
   pub version: Option<VersionInfo>,
   pub features: LmpFeatures,
   pub bredr: Option<BrEdrData>,
   pub le: Option<LeData>,
}

impl Peer {
   fn new(id: PeerId, address: DeviceAddress, connectable: bool) -> Self {
      Self {
         id,
         address,
         connectable,
         temporary: true,
         name: None,
         version: None,
         features: LmpFeatures::default(),
         bredr: None,
         le: address.is_le().then(LeData::default),
      }
   }

   pub fn mut_bredr(&mut self) -> &mut BrEdrData {
      self.bredr.get_or_insert_with(BrEdrData::default)
   }

   pub fn mut_le(&mut self) -> &mut LeData {
      self.le.get_or_insert_with(LeData::default)
   }

   pub fn set_inquiry_data(&mut self, response: &InquiryResponse) {
      let bredr = self.mut_bredr();
      bredr.page_scan_repetition_mode = response.page_scan_repetition_mode;
      bredr.clock_offset = response.clock_offset;
      bredr.class_of_device = response.class_of_device;
      if response.rssi.is_some() {
         bredr.rssi = response.rssi;
      }
      if let Some(eir) = &response.eir {
         bredr.eir = Some(eir.clone());
      }
      self.connectable = true;
   }

   /// Stores a name received from the controller.
   pub fn set_name(&mut self, raw: &[u8]) {
      let name = String::from_utf8_lossy(trim_name(raw));
      self.name = Some(SmolStr::new(name));
   }

   pub fn le_connection_state(&self) -> ConnectionState {
      self
         .le
         .as_ref()
         .map(|le| le.connection_state)
         .unwrap_or_default()
   }
}

// === Cache ===

#[derive(Default)]
struct CacheInner {
   peers: HashMap<PeerId, Peer>,
   by_address: HashMap<DeviceAddress, PeerId>,
}

impl CacheInner {
   fn insert(&mut self, address: DeviceAddress, connectable: bool) -> Peer {
      let mut rng = rand::thread_rng();
      let id = loop {
         let id = PeerId(rng.r#gen());
         if id.0 != 0 && !self.peers.contains_key(&id) {
            break id;
         }
      };

      let peer = Peer::new(id, address, connectable);
      debug!("New peer {id} at {address}");
      self.by_address.insert(address, id);
      self.peers.insert(id, peer.clone());
      peer
   }
}

/// Shared keyed peer store. Cheap to clone.
#[derive(Clone, Default)]
pub struct PeerCache {
   inner: Arc<Mutex<CacheInner>>,
}

impl PeerCache {
   pub fn new() -> Self {
      Self::default()
   }

   /// Creates a peer for `address`, or `None` if one already exists.
   pub fn new_peer(&self, address: DeviceAddress, connectable: bool) -> Option<Peer> {
      let mut inner = self.inner.lock();
      if inner.by_address.contains_key(&address) {
         return None;
      }
      Some(inner.insert(address, connectable))
   }

   pub fn find_by_id(&self, id: PeerId) -> Option<Peer> {
      self.inner.lock().peers.get(&id).cloned()
   }

   pub fn find_by_address(&self, address: &DeviceAddress) -> Option<Peer> {
      let inner = self.inner.lock();
      let id = inner.by_address.get(address)?;
      inner.peers.get(id).cloned()
   }

   pub fn find_or_create(&self, address: DeviceAddress, connectable: bool) -> Peer {
      let mut inner = self.inner.lock();
      if let Some(peer) = inner
         .by_address
         .get(&address)
         .and_then(|id| inner.peers.get(id))
      {
         return peer.clone();
      }
      inner.insert(address, connectable)
   }

   /// Mutates a cached peer in place and returns the closure's result.
   pub fn update<R>(&self, id: PeerId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
      let mut inner = self.inner.lock();
      let Some(peer) = inner.peers.get_mut(&id) else {
         trace!("Update for unknown peer {id}");
         return None;
      };
      Some(f(peer))
   }

   pub fn len(&self) -> usize {
      self.inner.lock().peers.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}
