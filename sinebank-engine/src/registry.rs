//! Channel addressing, per-channel configuration and the shared control state.
//!
//! The registry is pre-populated for the whole card × channel grid at construction;
//! addresses never come or go afterwards, so unknown addresses are simply ignored.
//! The worker never reads the registry in place: it copies a [`Snapshot`] under the
//! control lock and lets go before talking to hardware.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use sinebank_core::dsp::uv_to_volts;
use thiserror::Error;

/// Name of one physical card (e.g. `SV1`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CardId(String);

impl CardId {
    pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }
    #[inline] pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for CardId {
    fn from(s: &str) -> Self { Self::new(s) }
}

/// (card, channel index). Ordering is card first, then ascending index, which is the
/// order channels are bound to hardware tasks.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelAddress {
    pub card: CardId,
    pub index: u16,
}

impl ChannelAddress {
    pub fn new(card: impl Into<CardId>, index: u16) -> Self {
        Self { card: card.into(), index }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.card, self.index)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bad channel address {0:?}: expected CARD:INDEX or CARD/INDEX")]
pub struct AddressParseError(pub String);

impl FromStr for ChannelAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || AddressParseError(s.to_string());
        let (card, idx) = s.rsplit_once([':', '/']).ok_or_else(bad)?;
        let idx = idx.trim().trim_start_matches("ao").trim_start_matches("ai");
        let index = idx.parse::<u16>().map_err(|_| bad())?;
        let card = card.trim();
        if card.is_empty() {
            return Err(bad());
        }
        Ok(Self::new(card, index))
    }
}

/// The fixed card × channel grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub cards: Vec<CardId>,
    pub channels_per_card: u16,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            cards: ["SV1", "SV2", "SV3", "SV4"].into_iter().map(CardId::from).collect(),
            channels_per_card: 2,
        }
    }
}

impl Topology {
    pub fn new<I, S>(cards: I, channels_per_card: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { cards: cards.into_iter().map(CardId::new).collect(), channels_per_card }
    }

    pub fn addresses(&self) -> impl Iterator<Item = ChannelAddress> + '_ {
        self.cards.iter().flat_map(move |card| {
            (0..self.channels_per_card).map(move |index| ChannelAddress { card: card.clone(), index })
        })
    }
}

/// Per-channel output settings. Amplitude is held in integer microvolts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub amplitude_uv: i64,
    pub enabled: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { amplitude_uv: 1_000, enabled: false }
    }
}

impl ChannelConfig {
    #[allow(clippy::cast_precision_loss)]
    #[inline]
    pub fn amplitude_volts(&self) -> f64 { uv_to_volts(self.amplitude_uv as f64) }
}

/// Frequency and output rate; always replaced together.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GenerationParameters {
    pub frequency: f64,
    pub output_sample_rate: f64,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self { frequency: 1_000.0, output_sample_rate: 100_000.0 }
    }
}

#[derive(Clone, Debug)]
pub struct ChannelRegistry {
    channels: BTreeMap<ChannelAddress, ChannelConfig>,
    initial: ChannelConfig,
}

impl ChannelRegistry {
    pub fn new(topology: &Topology, initial: ChannelConfig) -> Self {
        let channels = topology.addresses().map(|a| (a, initial)).collect();
        Self { channels, initial }
    }

    pub fn get(&self, address: &ChannelAddress) -> Option<ChannelConfig> {
        self.channels.get(address).copied()
    }

    /// Returns `false` (and changes nothing) for addresses outside the grid.
    pub fn set_amplitude(&mut self, address: &ChannelAddress, amplitude_uv: i64) -> bool {
        self.channels.get_mut(address).map(|c| c.amplitude_uv = amplitude_uv).is_some()
    }

    /// Returns `false` (and changes nothing) for addresses outside the grid.
    pub fn set_enabled(&mut self, address: &ChannelAddress, enabled: bool) -> bool {
        self.channels.get_mut(address).map(|c| c.enabled = enabled).is_some()
    }

    /// Put every channel back to its construction-time settings.
    pub fn reset(&mut self) {
        let initial = self.initial;
        self.channels.values_mut().for_each(|c| *c = initial);
    }

    pub fn enabled_count(&self) -> usize {
        self.channels.values().filter(|c| c.enabled).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChannelAddress, &ChannelConfig)> {
        self.channels.iter()
    }
}

/// Everything guarded by the engine's control lock.
#[derive(Clone, Debug)]
pub struct ControlState {
    pub registry: ChannelRegistry,
    pub params: GenerationParameters,
}

impl ControlState {
    pub fn snapshot(&self) -> Snapshot {
        let enabled = self
            .registry
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(a, c)| (a.clone(), c.amplitude_uv))
            .collect();
        Snapshot { params: self.params, enabled }
    }
}

/// One enabled channel as the worker will drive it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelDrive {
    pub index: u16,
    pub amplitude_uv: i64,
}

/// Copy of the control state taken once per worker iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub params: GenerationParameters,
    /// Enabled channels in address order.
    pub enabled: Vec<(ChannelAddress, i64)>,
}

impl Snapshot {
    /// Enabled channels grouped per card, indices ascending within each card.
    pub fn by_card(&self) -> BTreeMap<CardId, Vec<ChannelDrive>> {
        let mut cards: BTreeMap<CardId, Vec<ChannelDrive>> = BTreeMap::new();
        for (addr, amplitude_uv) in &self.enabled {
            cards
                .entry(addr.card.clone())
                .or_default()
                .push(ChannelDrive { index: addr.index, amplitude_uv: *amplitude_uv });
        }
        for drives in cards.values_mut() {
            drives.sort_by_key(|d| d.index);
        }
        cards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(&Topology::default(), ChannelConfig::default())
    }

    #[test]
    fn grid_is_prepopulated_and_disabled() {
        let r = registry();
        assert_eq!(r.iter().count(), 8);
        assert_eq!(r.enabled_count(), 0);
        assert_eq!(r.get(&ChannelAddress::new("SV4", 1)), Some(ChannelConfig::default()));
        assert_eq!(r.get(&ChannelAddress::new("SV5", 0)), None);
        assert_eq!(r.get(&ChannelAddress::new("SV1", 2)), None);
    }

    #[test]
    fn unknown_addresses_are_ignored() {
        let mut r = registry();
        assert!(!r.set_enabled(&ChannelAddress::new("SV9", 0), true));
        assert!(!r.set_amplitude(&ChannelAddress::new("SV1", 7), 5));
        assert_eq!(r.enabled_count(), 0);
        assert_eq!(r.iter().count(), 8);
    }

    #[test]
    fn reset_restores_defaults() {
        let mut r = registry();
        let a = ChannelAddress::new("SV2", 1);
        r.set_enabled(&a, true);
        r.set_amplitude(&a, 250_000);
        r.reset();
        assert_eq!(r.get(&a), Some(ChannelConfig::default()));
    }

    #[test]
    fn snapshot_groups_by_card_in_index_order() {
        let mut r = registry();
        for (card, idx, uv) in [("SV3", 1, 30), ("SV1", 1, 11), ("SV3", 0, 20), ("SV1", 0, 10)] {
            let a = ChannelAddress::new(card, idx);
            r.set_enabled(&a, true);
            r.set_amplitude(&a, uv);
        }
        let snap = ControlState { registry: r, params: GenerationParameters::default() }.snapshot();
        let cards = snap.by_card();
        assert_eq!(cards.len(), 2);
        let sv1: Vec<_> = cards[&CardId::from("SV1")].iter().map(|d| (d.index, d.amplitude_uv)).collect();
        assert_eq!(sv1, vec![(0, 10), (1, 11)]);
        let sv3: Vec<_> = cards[&CardId::from("SV3")].iter().map(|d| (d.index, d.amplitude_uv)).collect();
        assert_eq!(sv3, vec![(0, 20), (1, 30)]);
    }

    #[test]
    fn parses_addresses() {
        assert_eq!("SV1:0".parse::<ChannelAddress>().unwrap(), ChannelAddress::new("SV1", 0));
        assert_eq!("SV2/ao1".parse::<ChannelAddress>().unwrap(), ChannelAddress::new("SV2", 1));
        assert!("SV2".parse::<ChannelAddress>().is_err());
        assert!(":1".parse::<ChannelAddress>().is_err());
        assert!("SV1:x".parse::<ChannelAddress>().is_err());
    }

    #[test]
    fn amplitude_converts_to_volts() {
        let c = ChannelConfig { amplitude_uv: 2_500_000, enabled: true };
        assert!((c.amplitude_volts() - 2.5).abs() < 1e-12);
    }
}
