use crate::ports::SSID_MAX_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: heapless::String<SSID_MAX_LEN>,
    pub rssi: i8,
    pub channel: u8,
    pub secured: bool,
}

impl AccessPoint {
    pub fn new(ssid: &str, rssi: i8) -> Self {
        let mut bounded = heapless::String::new();
        for ch in ssid.chars() {
            if bounded.push(ch).is_err() {
                break;
            }
        }
        Self {
            ssid: bounded,
            rssi,
            channel: 0,
            secured: true,
        }
    }

    pub fn quality(&self) -> u8 {
        signal_quality(self.rssi)
    }
}

/// Maps RSSI onto 0..=100: -100 dBm and below is 0, -50 dBm and above is 100.
pub fn signal_quality(rssi: i8) -> u8 {
    let rssi = i16::from(rssi);
    if rssi <= -100 {
        0
    } else if rssi >= -50 {
        100
    } else {
        (2 * (rssi + 100)) as u8
    }
}

/// Strongest first, one entry per SSID, and nothing below `min_quality`.
pub fn rank_networks(mut networks: Vec<AccessPoint>, min_quality: u8) -> Vec<AccessPoint> {
    networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));

    let mut ranked: Vec<AccessPoint> = Vec::with_capacity(networks.len());
    for network in networks {
        if ranked.iter().any(|kept| kept.ssid == network.ssid) {
            continue;
        }
        ranked.push(network);
    }

    ranked.retain(|network| network.quality() >= min_quality);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn quality_mapping_is_clamped_and_linear() {
        assert_eq!(signal_quality(-128), 0);
        assert_eq!(signal_quality(-100), 0);
        assert_eq!(signal_quality(-90), 20);
        assert_eq!(signal_quality(-70), 60);
        assert_eq!(signal_quality(-50), 100);
        assert_eq!(signal_quality(-20), 100);
    }

    #[test]
    fn duplicates_collapse_to_strongest_and_weak_networks_drop() {
        let networks = vec![
            AccessPoint::new("ssidA", -70),
            AccessPoint::new("ssidB", -90),
            AccessPoint::new("ssidA", -40),
        ];

        let ranked = rank_networks(networks, 30);

        assert_eq!(ranked, vec![AccessPoint::new("ssidA", -40)]);
    }

    #[test]
    fn zero_threshold_keeps_every_distinct_ssid_in_signal_order() {
        let networks = vec![
            AccessPoint::new("attic", -85),
            AccessPoint::new("home", -55),
            AccessPoint::new("garage", -72),
            AccessPoint::new("home", -60),
        ];

        let ranked: Vec<_> = rank_networks(networks, 0)
            .into_iter()
            .map(|network| (network.ssid.to_string(), network.rssi))
            .collect();

        assert_eq!(
            ranked,
            vec![
                ("home".to_string(), -55),
                ("garage".to_string(), -72),
                ("attic".to_string(), -85),
            ]
        );
    }
}
