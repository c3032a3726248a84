use std::ops::{Deref, DerefMut};

use log::info;

use crate::{
    block::BlockDevice,
    error::Error,
    fat::FatVolume,
    remote::{HandshakeState, RemoteBlockDevice, RemoteConfig, Transport},
    transfer::FileTransferEngine,
};

/// A mounted card: the engine over its volume and directory caches.
pub struct Session<D> {
    engine: FileTransferEngine<D>,
}

impl<T: Transport> Session<RemoteBlockDevice<T>> {
    /// Waits for the helper's beacon, then mounts the card behind it.
    pub fn connect(transport: T, config: RemoteConfig) -> Result<Self, Error> {
        let mut device = RemoteBlockDevice::new(transport, config);
        let version = device.handshake()?;
        info!("connected to remote helper {version}");
        Self::open(device)
    }

    pub fn handshake(&self) -> &HandshakeState {
        self.engine.volume().device().handshake_state()
    }

    /// Asks the helper to quit and hands back the transport.
    pub fn close(self) -> Result<T, Error> {
        let mut device = self.engine.into_volume().into_device();
        device.terminate()?;
        Ok(device.into_transport())
    }
}

impl<D: BlockDevice> Session<D> {
    pub fn open(device: D) -> Result<Self, Error> {
        let volume = FatVolume::load(device)?;
        let engine = FileTransferEngine::new(volume)?;
        Ok(Self { engine })
    }

    pub fn engine(&mut self) -> &mut FileTransferEngine<D> {
        &mut self.engine
    }

    pub fn into_engine(self) -> FileTransferEngine<D> {
        self.engine
    }
}

impl<D> Deref for Session<D> {
    type Target = FileTransferEngine<D>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl<D> DerefMut for Session<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.engine
    }
}
