//! BR/EDR peer interrogation.
//!
//! After a link comes up the remote name, version and supported features
//! are read concurrently, skipping whatever the cache already knows. If
//! page 0 advertises extended features the remaining pages are read one
//! after the other.

use futures::future;
use log::{debug, trace};

use crate::{
   error::{GapError, Result},
   hci::{Command, ConnectionHandle, Event, EventCode, OpCode, SharedTransport},
   peer::{Peer, PeerCache, PeerId},
};

const CLOCK_OFFSET_VALID: u16 = 0x8000;

pub struct BrEdrInterrogator {
   transport: SharedTransport,
   cache: PeerCache,
}

impl BrEdrInterrogator {
   pub fn new(transport: SharedTransport, cache: PeerCache) -> Self {
      Self { transport, cache }
   }

   /// Fills in the cached data for `peer_id` over the link `handle`.
   ///
   /// Dropping the future abandons the interrogation.
   pub async fn interrogate(&self, peer_id: PeerId, handle: ConnectionHandle) -> Result<()> {
      let peer = self
         .cache
         .find_by_id(peer_id)
         .ok_or(GapError::PeerNotFound(peer_id))?;
      debug!("Interrogating {peer_id} on {handle}");

      let name = async {
         if peer.name.is_some() {
            return Ok(());
         }
         self.read_name(&peer).await
      };
      let version = async {
         if peer.version.is_some() {
            return Ok(());
         }
         self.read_version(peer_id, handle).await
      };
      let features = async {
         if peer.features.has_page(0) {
            return Ok(());
         }
         self.read_features(peer_id, handle).await
      };
      future::try_join3(name, version, features).await?;

      self.read_extended_features(peer_id, handle).await?;
      debug!("Interrogation of {peer_id} complete");
      Ok(())
   }

   async fn read_name(&self, peer: &Peer) -> Result<()> {
      let bredr = peer.bredr.clone().unwrap_or_default();
      let clock_offset = if bredr.clock_offset != 0 {
         bredr.clock_offset | CLOCK_OFFSET_VALID
      } else {
         0
      };
      let command = Command::RemoteNameRequest {
         address: peer.address.value,
         page_scan_repetition_mode: bredr.page_scan_repetition_mode,
         clock_offset,
      };
      let event = self
         .transport
         .send_exclusive_command(
            command,
            EventCode::RemoteNameRequestComplete,
            &[OpCode::INQUIRY],
         )?
         .complete(EventCode::RemoteNameRequestComplete)
         .await?;
      let Event::RemoteNameRequestComplete { name, .. } = event else {
         return Err(GapError::CommandRejected("unexpected remote name event"));
      };
      self.cache.update(peer.id, |peer| peer.set_name(&name));
      trace!("{}: name read", peer.id);
      Ok(())
   }

   async fn read_version(&self, peer_id: PeerId, handle: ConnectionHandle) -> Result<()> {
      let event = self
         .transport
         .send_command(Command::ReadRemoteVersionInfo(handle))?
         .complete(EventCode::ReadRemoteVersionInfoComplete)
         .await?;
      let Event::ReadRemoteVersionInfoComplete { version, .. } = event else {
         return Err(GapError::CommandRejected("unexpected version event"));
      };
      self.cache.update(peer_id, |peer| peer.version = Some(version));
      Ok(())
   }

   async fn read_features(&self, peer_id: PeerId, handle: ConnectionHandle) -> Result<()> {
      let event = self
         .transport
         .send_command(Command::ReadRemoteSupportedFeatures(handle))?
         .complete(EventCode::ReadRemoteSupportedFeaturesComplete)
         .await?;
      let Event::ReadRemoteSupportedFeaturesComplete { features, .. } = event else {
         return Err(GapError::CommandRejected("unexpected features event"));
      };
      self.cache.update(peer_id, |peer| peer.features.set_page(0, features));
      Ok(())
   }

   async fn read_extended_features(&self, peer_id: PeerId, handle: ConnectionHandle) -> Result<()> {
      let supported = self
         .cache
         .find_by_id(peer_id)
         .is_some_and(|peer| peer.features.supports_extended_features());
      if !supported {
         return Ok(());
      }

      // The page count reported with page 1 bounds the rest of the reads.
      let max_page = self.read_extended_page(peer_id, handle, 1).await?;
      for page in 2..=max_page {
         self.read_extended_page(peer_id, handle, page).await?;
      }
      Ok(())
   }

   /// Reads one extended features page, returning the reported last page.
   async fn read_extended_page(
      &self,
      peer_id: PeerId,
      handle: ConnectionHandle,
      page: u8,
   ) -> Result<u8> {
      let event = self
         .transport
         .send_command(Command::ReadRemoteExtendedFeatures { handle, page })?
         .complete(EventCode::ReadRemoteExtendedFeaturesComplete)
         .await?;
      let Event::ReadRemoteExtendedFeaturesComplete {
         page: read,
         max_page,
         features,
         ..
      } = event
      else {
         return Err(GapError::CommandRejected("unexpected extended features event"));
      };
      if read != page {
         return Err(GapError::CommandRejected("extended features page mismatch"));
      }
      trace!("{peer_id}: feature page {read}/{max_page}");
      self.cache.update(peer_id, |peer| {
         peer.features.set_page(read, features);
         peer.features.set_last_page_number(max_page);
      });
      Ok(max_page)
   }
}
