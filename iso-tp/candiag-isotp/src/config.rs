//! ISO-TP configuration container.

use core::time::Duration;

/// Largest application payload a classic ISO-TP transfer can carry.
pub const MAX_ISOTP_PAYLOAD: usize = 4095;

/// Configuration for one ISO-TP channel.
///
/// CAN identifiers are not part of this struct; the diagnostic links in
/// [`crate::link`] carry the physical/functional address set and reuse one
/// config for both directions.
#[derive(Debug, Clone)]
pub struct IsoTpConfig {
    /// Consecutive frames allowed before requesting a new flow control
    /// (0 = unlimited).
    pub block_size: u8,
    /// Minimum separation time advertised to and enforced against the peer.
    pub st_min: Duration,
    /// Maximum number of FlowControl WAIT frames tolerated before failing.
    pub wft_max: u8,
    /// Padding byte for transmitted frames (None = no padding).
    pub padding: Option<u8>,
    /// Maximum application payload length accepted.
    pub max_payload_len: usize,
    /// Timeout waiting for transmit availability.
    pub n_as: Duration,
    /// Timeout waiting for receive availability.
    pub n_ar: Duration,
    /// Timeout waiting for flow control after a First Frame.
    pub n_bs: Duration,
    /// Timeout waiting for a Consecutive Frame while receiving.
    pub n_br: Duration,
    /// Timeout between consecutive frame transmissions.
    pub n_cs: Duration,
}

impl Default for IsoTpConfig {
    /// BS=0 / STmin=0 (maximum throughput on a trusted link), frames padded
    /// with 0x00, 4 KB payload limit, 1 s protocol timeouts.
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: Duration::from_millis(0),
            wft_max: 4,
            padding: Some(0x00),
            max_payload_len: MAX_ISOTP_PAYLOAD,
            n_as: Duration::from_millis(1000),
            n_ar: Duration::from_millis(1000),
            n_bs: Duration::from_millis(1000),
            n_br: Duration::from_millis(1000),
            n_cs: Duration::from_millis(1000),
        }
    }
}

impl IsoTpConfig {
    /// Reject invalid payload limits.
    #[allow(clippy::result_unit_err)]
    pub fn validate(&self) -> Result<(), ()> {
        if self.max_payload_len == 0 || self.max_payload_len > MAX_ISOTP_PAYLOAD {
            return Err(());
        }
        Ok(())
    }
}
