//! Connectors and their cached kernel state

use drm::control::{connector, crtc, Mode, ModeTypeFlags};

use super::{
    commit::AtomicCommit,
    device::{ConnectorInfo, KmsDevice},
    error::{access, Error},
    object::{raw_id, DrmObject, ObjectId},
};

const REQUIRED_PROPERTIES: &[&str] = &["CRTC_ID"];

/// A physical display port
#[derive(Debug)]
pub struct Connector {
    handle: connector::Handle,
    object: DrmObject,
    info: ConnectorInfo,
}

impl Connector {
    pub(crate) fn new<D: KmsDevice + ?Sized>(device: &D, handle: connector::Handle) -> Result<Connector, Error> {
        let info = device
            .connector_info(handle)
            .map_err(access("Error loading connector info", device.dev_path()))?;
        let mut object = DrmObject::new(ObjectId::Connector(handle));
        object.update_properties(device, REQUIRED_PROPERTIES)?;
        Ok(Connector { handle, object, info })
    }

    /// Kernel handle of the connector
    pub fn handle(&self) -> connector::Handle {
        self.handle
    }

    /// Name of the connector, e.g. `DP-1`
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Property cache of the connector
    pub fn object(&self) -> &DrmObject {
        &self.object
    }

    pub(crate) fn object_mut(&mut self) -> &mut DrmObject {
        &mut self.object
    }

    /// Connection state at the last scan
    pub fn state(&self) -> connector::State {
        self.info.state
    }

    /// Returns true if a monitor was attached at the last scan
    pub fn is_connected(&self) -> bool {
        self.info.state == connector::State::Connected
    }

    /// Modes advertised by the monitor
    pub fn modes(&self) -> &[Mode] {
        &self.info.modes
    }

    /// Returns true if the mode is advertised by the monitor
    pub fn supports_mode(&self, mode: &Mode) -> bool {
        self.info.modes.contains(mode)
    }

    /// The mode flagged as preferred, otherwise the first mode
    pub fn preferred_mode(&self) -> Option<Mode> {
        self.info
            .modes
            .iter()
            .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
            .or_else(|| self.info.modes.first())
            .copied()
    }

    /// Crtcs able to drive this connector
    pub fn possible_crtcs(&self) -> &[crtc::Handle] {
        &self.info.possible_crtcs
    }

    /// Physical size in millimeters
    pub fn physical_size(&self) -> Option<(u32, u32)> {
        self.info.physical_size
    }

    /// Returns true for head-mounted displays and similar, which are not part of the desktop
    pub fn is_non_desktop(&self) -> bool {
        self.info.non_desktop
    }

    /// Crtc driving this connector at the last scan
    pub fn current_crtc(&self) -> Option<crtc::Handle> {
        self.info.current_crtc
    }

    /// Apply a new scan result
    ///
    /// Returns whether the mode list changed.
    pub fn update<D: KmsDevice + ?Sized>(&mut self, device: &D) -> Result<bool, Error> {
        let info = device
            .connector_info(self.handle)
            .map_err(access("Error loading connector info", device.dev_path()))?;
        self.object.update_properties(device, REQUIRED_PROPERTIES)?;
        let changed = info.modes != self.info.modes;
        self.info = info;
        Ok(changed)
    }

    /// Stage routing this connector to a crtc
    pub fn bind(&mut self, commit: &mut AtomicCommit, crtc: crtc::Handle) -> Result<(), Error> {
        self.object.stage(commit, "CRTC_ID", raw_id(crtc))
    }

    /// Stage detaching this connector from its crtc
    pub fn disable(&mut self, commit: &mut AtomicCommit) -> Result<(), Error> {
        self.object.stage(commit, "CRTC_ID", 0)
    }
}

#[cfg(test)]
mod test {
    use super::Connector;
    use crate::backend::drm::device::test::{preferred_mode, test_mode, TestDevice};

    #[test]
    fn preferred_mode_falls_back_to_first() {
        let (device, out) = TestDevice::single_output(
            "DP-1",
            vec![test_mode(2560, 1440, 60), test_mode(1920, 1080, 60)],
        );
        let mut connector = Connector::new(&device, out.connector).unwrap();
        assert_eq!(connector.name(), "DP-1");
        assert!(connector.is_connected());
        assert_eq!(connector.preferred_mode().map(|m| m.size()), Some((2560, 1440)));

        device.set_modes(
            out.connector,
            vec![test_mode(2560, 1440, 60), preferred_mode(1920, 1080, 60)],
        );
        assert!(connector.update(&device).unwrap());
        assert_eq!(connector.preferred_mode().map(|m| m.size()), Some((1920, 1080)));
        assert!(!connector.update(&device).unwrap());
    }

    #[test]
    fn disconnected_has_no_modes() {
        let (device, out) = TestDevice::single_output("DP-1", vec![test_mode(1920, 1080, 60)]);
        let mut connector = Connector::new(&device, out.connector).unwrap();
        device.set_connected(out.connector, false);
        assert!(connector.update(&device).unwrap());
        assert!(!connector.is_connected());
        assert!(connector.preferred_mode().is_none());
    }
}
