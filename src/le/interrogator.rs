//! LE peer interrogation: remote version and LE feature mask.

use futures::future;
use log::debug;

use crate::{
   error::{GapError, Result},
   hci::{Command, ConnectionHandle, Event, EventCode, SharedTransport},
   peer::{PeerCache, PeerId},
};

pub struct LowEnergyInterrogator {
   transport: SharedTransport,
   cache: PeerCache,
}

impl LowEnergyInterrogator {
   pub fn new(transport: SharedTransport, cache: PeerCache) -> Self {
      Self { transport, cache }
   }

   pub async fn interrogate(&self, peer_id: PeerId, handle: ConnectionHandle) -> Result<()> {
      let peer = self
         .cache
         .find_by_id(peer_id)
         .ok_or(GapError::PeerNotFound(peer_id))?;
      debug!("Interrogating LE peer {peer_id} on {handle}");

      let version = async {
         if peer.version.is_some() {
            return Ok(());
         }
         self.read_version(peer_id, handle).await
      };
      let features = async {
         if peer.le.as_ref().is_some_and(|le| le.features.is_some()) {
            return Ok(());
         }
         self.read_features(peer_id, handle).await
      };

      future::try_join(version, features).await?;
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
         .send_command(Command::LeReadRemoteFeatures(handle))?
         .complete(EventCode::LeReadRemoteFeaturesComplete)
         .await?;
      let Event::LeReadRemoteFeaturesComplete { features, .. } = event else {
         return Err(GapError::CommandRejected("unexpected LE features event"));
      };
      self.cache.update(peer_id, |peer| peer.mut_le().features = Some(features));
      Ok(())
   }
}
