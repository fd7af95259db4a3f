//! Radio signal strength probing.
//!
//! The UDP transport carries no per-packet RSSI, so the agent asks the
//! operating system for the current link level instead. The probe is a
//! trait so bench setups and tests can supply a constant or nothing at all.

use crate::config::ProbeConfig;

pub trait RssiProbe: Send + Sync {
    /// Current radio RSSI in dBm, or `None` when unknown.
    fn current_rssi(&self) -> Option<f64>;
}

/// Reads the signal level column of `/proc/net/wireless` for one interface.
pub struct WirelessProcProbe {
    interface: String,
}

impl WirelessProcProbe {
    pub fn new(interface: String) -> Self {
        WirelessProcProbe { interface }
    }
}

impl RssiProbe for WirelessProcProbe {
    fn current_rssi(&self) -> Option<f64> {
        let content = std::fs::read_to_string("/proc/net/wireless").ok()?;
        parse_wireless(&content, &self.interface)
    }
}

/// Extract the signal level (dBm) for `interface` from the contents of
/// `/proc/net/wireless`. The file has two header lines followed by one row
/// per interface:
///
/// ```text
/// Inter-| sta-|   Quality        |   Discarded packets
///  face | tus | link level noise |  nwid  crypt   frag
///  wlan0: 0000   54.  -56.  -256        0      0      0
/// ```
fn parse_wireless(content: &str, interface: &str) -> Option<f64> {
    for line in content.lines().skip(2) {
        let mut fields = line.split_whitespace();
        let name = fields.next()?.trim_end_matches(':');
        if name != interface {
            continue;
        }
        // status, link quality, then signal level
        let level = fields.nth(2)?;
        return level.trim_end_matches('.').parse::<f64>().ok();
    }
    None
}

/// Constant RSSI for radios without an OS-visible level.
pub struct FixedRssiProbe(pub f64);

impl RssiProbe for FixedRssiProbe {
    fn current_rssi(&self) -> Option<f64> {
        Some(self.0)
    }
}

/// No RSSI source; metric aggregation falls back to defaults.
pub struct NoRssiProbe;

impl RssiProbe for NoRssiProbe {
    fn current_rssi(&self) -> Option<f64> {
        None
    }
}

/// Build the probe selected by the config.
pub fn from_config(cfg: &ProbeConfig) -> Box<dyn RssiProbe> {
    match cfg {
        ProbeConfig::Proc { interface } => Box::new(WirelessProcProbe::new(interface.clone())),
        ProbeConfig::Fixed { dbm } => Box::new(FixedRssiProbe(*dbm)),
        ProbeConfig::Off => Box::new(NoRssiProbe),
    }
}
