//! Per-update traffic accounting.

use rigelnet_transport::UDP_HEADER_SIZE;
use std::ops::{Add, AddAssign};

/// Bytes moved during one or more `update()` calls.
///
/// Sizes include an estimate of the UDP header for every datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    /// Bytes sent
    pub upload_bytes: u64,
    /// Bytes received
    pub download_bytes: u64,
}

impl Telemetry {
    /// Create zeroed telemetry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one sent datagram of `payload` bytes
    pub fn record_upload(&mut self, payload: usize) {
        self.upload_bytes += (payload + UDP_HEADER_SIZE) as u64;
    }

    /// Account for one received datagram of `payload` bytes
    pub fn record_download(&mut self, payload: usize) {
        self.download_bytes += (payload + UDP_HEADER_SIZE) as u64;
    }
}

impl AddAssign for Telemetry {
    fn add_assign(&mut self, rhs: Self) {
        self.upload_bytes += rhs.upload_bytes;
        self.download_bytes += rhs.download_bytes;
    }
}

impl Add for Telemetry {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}
