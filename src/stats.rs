//! Per-device packet counters with one-minute rate windows.
//!
//! Increments happen on the radio receive path and on outbound command
//! success/failure; reads feed the topology view.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::ieee::Ieee;

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Counters {
    rx_packets: u64,
    tx_packets: u64,
    errors: u64,
    rx_times: VecDeque<Instant>,
    tx_times: VecDeque<Instant>,
}

impl Counters {
    fn trim(times: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = times.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                times.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub errors: u64,
    /// Packets received in the last minute.
    pub rx_per_minute: usize,
    pub tx_per_minute: usize,
}

#[derive(Debug, Default)]
pub struct PacketStats {
    devices: DashMap<Ieee, Counters>,
}

impl PacketStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rx(&self, ieee: &Ieee) {
        let now = Instant::now();
        let mut entry = self.devices.entry(ieee.clone()).or_default();
        entry.rx_packets += 1;
        entry.rx_times.push_back(now);
        Counters::trim(&mut entry.rx_times, now);
    }

    pub fn record_tx(&self, ieee: &Ieee) {
        let now = Instant::now();
        let mut entry = self.devices.entry(ieee.clone()).or_default();
        entry.tx_packets += 1;
        entry.tx_times.push_back(now);
        Counters::trim(&mut entry.tx_times, now);
    }

    pub fn record_error(&self, ieee: &Ieee) {
        self.devices.entry(ieee.clone()).or_default().errors += 1;
    }

    pub fn get(&self, ieee: &Ieee) -> DeviceStats {
        let now = Instant::now();
        match self.devices.get_mut(ieee) {
            Some(mut entry) => {
                Counters::trim(&mut entry.rx_times, now);
                Counters::trim(&mut entry.tx_times, now);
                DeviceStats {
                    rx_packets: entry.rx_packets,
                    tx_packets: entry.tx_packets,
                    errors: entry.errors,
                    rx_per_minute: entry.rx_times.len(),
                    tx_per_minute: entry.tx_times.len(),
                }
            }
            None => DeviceStats {
                rx_packets: 0,
                tx_packets: 0,
                errors: 0,
                rx_per_minute: 0,
                tx_per_minute: 0,
            },
        }
    }

    pub fn remove(&self, ieee: &Ieee) {
        self.devices.remove(ieee);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ieee() -> Ieee {
        Ieee::parse("00:11:22:33:44:55:66:77").unwrap()
    }

    #[test]
    fn counters_accumulate() {
        let stats = PacketStats::new();
        stats.record_rx(&ieee());
        stats.record_rx(&ieee());
        stats.record_tx(&ieee());
        stats.record_error(&ieee());

        let snapshot = stats.get(&ieee());
        assert_eq!(snapshot.rx_packets, 2);
        assert_eq!(snapshot.tx_packets, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.rx_per_minute, 2);
    }

    #[test]
    fn unknown_device_reads_zero() {
        let stats = PacketStats::new();
        let snapshot = stats.get(&ieee());
        assert_eq!(snapshot.rx_packets, 0);
        assert_eq!(snapshot.rx_per_minute, 0);
    }

    #[test]
    fn remove_resets_device() {
        let stats = PacketStats::new();
        stats.record_rx(&ieee());
        stats.remove(&ieee());
        assert_eq!(stats.get(&ieee()).rx_packets, 0);
    }
}
