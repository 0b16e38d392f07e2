//! Connector hotplug tracking and crtc assignment

use std::collections::HashMap;

use drm::control::{connector, crtc};
use tracing::debug;

use super::device::{ConnectorInfo, KmsDevice};

/// Tracks connected/disconnected transitions between scans
#[derive(Debug, Default)]
pub struct ConnectorScanner {
    connectors: HashMap<connector::Handle, ConnectorInfo>,
}

/// Result of [`ConnectorScanner::scan`]
#[derive(Debug, Default, Clone)]
pub struct ConnectorScanResult {
    /// Connectors that got plugged in since last scan
    pub connected: Vec<ConnectorInfo>,
    /// Connectors that got unplugged or vanished since last scan
    pub disconnected: Vec<ConnectorInfo>,
}

impl ConnectorScanner {
    /// Create new [`ConnectorScanner`]
    pub fn new() -> Self {
        Default::default()
    }

    /// Should be called on every device changed event
    pub fn scan<D: KmsDevice + ?Sized>(&mut self, device: &D) -> std::io::Result<ConnectorScanResult> {
        let handles = device.resource_handles()?.connectors;

        let mut result = ConnectorScanResult::default();

        for conn in handles.iter().filter_map(|conn| device.connector_info(*conn).ok()) {
            use connector::State;
            let curr_state = conn.state;
            if let Some(old) = self.connectors.insert(conn.handle, conn.clone()) {
                match (old.state, curr_state) {
                    (State::Connected, State::Disconnected) => result.disconnected.push(conn),
                    (State::Disconnected | State::Unknown, State::Connected) => result.connected.push(conn),
                    _ => {}
                }
            } else if curr_state == State::Connected {
                result.connected.push(conn);
            }
        }

        // MST connectors disappear entirely instead of reporting a disconnect
        let gone: Vec<connector::Handle> = self
            .connectors
            .keys()
            .filter(|h| !handles.contains(h))
            .copied()
            .collect();
        for handle in gone {
            if let Some(info) = self.connectors.remove(&handle) {
                if info.state == connector::State::Connected {
                    result.disconnected.push(info);
                }
            }
        }

        Ok(result)
    }

    /// Get map of all connectors, connected and disconnected ones.
    pub fn connectors(&self) -> &HashMap<connector::Handle, ConnectorInfo> {
        &self.connectors
    }
}

/// Assigns crtcs to connectors
///
/// A connector keeps the crtc the kernel already routes it to if that one is free,
/// otherwise it gets the first free crtc it is compatible with.
#[derive(Debug, Default)]
pub struct CrtcMapper {
    crtcs: HashMap<connector::Handle, crtc::Handle>,
}

impl CrtcMapper {
    /// Create an empty mapper
    pub fn new() -> Self {
        Self::default()
    }

    fn is_available(&self, crtc: &crtc::Handle) -> bool {
        !self.crtcs.values().any(|v| v == crtc)
    }

    /// Crtc the connector would get, without claiming it
    pub fn candidate(
        &self,
        connector: connector::Handle,
        restored: Option<crtc::Handle>,
        possible: &[crtc::Handle],
    ) -> Option<crtc::Handle> {
        if let Some(crtc) = self.crtcs.get(&connector) {
            return Some(*crtc);
        }
        restored
            .filter(|crtc| possible.contains(crtc) && self.is_available(crtc))
            .or_else(|| possible.iter().find(|crtc| self.is_available(crtc)).copied())
    }

    /// Claim a crtc for the connector
    pub fn claim(
        &mut self,
        connector: connector::Handle,
        restored: Option<crtc::Handle>,
        possible: &[crtc::Handle],
    ) -> Option<crtc::Handle> {
        let crtc = self.candidate(connector, restored, possible)?;
        if self.crtcs.insert(connector, crtc).is_none() {
            debug!(?connector, ?crtc, "claimed crtc");
        }
        Some(crtc)
    }

    /// Release whatever crtc the connector holds
    pub fn release(&mut self, connector: connector::Handle) -> Option<crtc::Handle> {
        self.crtcs.remove(&connector)
    }

    /// Crtc currently claimed by the connector
    pub fn crtc_for_connector(&self, connector: &connector::Handle) -> Option<crtc::Handle> {
        self.crtcs.get(connector).copied()
    }

    /// Connector currently holding the crtc
    pub fn connector_for_crtc(&self, crtc: &crtc::Handle) -> Option<connector::Handle> {
        self.crtcs.iter().find(|(_, c)| *c == crtc).map(|(conn, _)| *conn)
    }
}

#[cfg(test)]
mod test {
    use super::{ConnectorScanner, CrtcMapper};
    use crate::backend::drm::device::test::{test_mode, TestDevice};

    #[test]
    fn scan_reports_transitions() {
        let device = TestDevice::new();
        let crtc = device.add_crtc();
        let a = device.add_connector("DP-1", vec![test_mode(1920, 1080, 60)], &[crtc]);
        let b = device.add_connector("DP-2", vec![test_mode(1920, 1080, 60)], &[crtc]);
        device.set_connected(b, false);

        let mut scanner = ConnectorScanner::new();
        let result = scanner.scan(&device).unwrap();
        assert_eq!(result.connected.len(), 1);
        assert_eq!(result.connected[0].handle, a);
        assert!(result.disconnected.is_empty());

        let result = scanner.scan(&device).unwrap();
        assert!(result.connected.is_empty() && result.disconnected.is_empty());

        device.set_connected(a, false);
        device.set_connected(b, true);
        let result = scanner.scan(&device).unwrap();
        assert_eq!(result.connected[0].handle, b);
        assert_eq!(result.disconnected[0].handle, a);
        assert_eq!(scanner.connectors().len(), 2);
    }

    #[test]
    fn mapper_prefers_restored_crtc() {
        let device = TestDevice::new();
        let c1 = device.add_crtc();
        let c2 = device.add_crtc();
        let a = device.add_connector("DP-1", vec![], &[c1, c2]);
        let b = device.add_connector("DP-2", vec![], &[c1, c2]);
        let c = device.add_connector("DP-3", vec![], &[c1, c2]);

        let mut mapper = CrtcMapper::new();
        assert_eq!(mapper.claim(a, Some(c2), &[c1, c2]), Some(c2));
        // restored crtc already taken, falls back to the first free one
        assert_eq!(mapper.claim(b, Some(c2), &[c1, c2]), Some(c1));
        assert_eq!(mapper.claim(c, None, &[c1, c2]), None);
        assert_eq!(mapper.claim(a, None, &[c1, c2]), Some(c2));
        assert_eq!(mapper.connector_for_crtc(&c1), Some(b));

        assert_eq!(mapper.release(b), Some(c1));
        assert_eq!(mapper.candidate(c, None, &[c1, c2]), Some(c1));
    }
}
