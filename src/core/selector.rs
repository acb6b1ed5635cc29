use std::{collections::BTreeMap, net::IpAddr};

use rand::Rng;
use thiserror::Error;

use crate::config::SelectionStrategy;

/// Selection failure: the resolved target set was empty or carried no weight.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    #[error("no target available")]
    NoTarget,
}

/// Trait defining the interface for backend selection strategies.
///
/// One strategy is chosen system-wide at startup; `select` is called per
/// request with the client identity and the resolved target set.
pub trait TargetSelector: Send + Sync + 'static {
    /// Pick one backend address from a weighted target set.
    fn select(&self, client: IpAddr, targets: &BTreeMap<String, u32>)
    -> Result<String, SelectError>;

    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn TargetSelector>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Deterministic client-IP hashing strategy (the default).
///
/// The same IP always lands on the same backend while the target set is
/// unchanged, which gives session stickiness without proxy-side state. The
/// mix is not cryptographic; only the pinning property matters.
pub struct IpHashSelector;

impl TargetSelector for IpHashSelector {
    fn select(
        &self,
        client: IpAddr,
        targets: &BTreeMap<String, u32>,
    ) -> Result<String, SelectError> {
        if targets.is_empty() {
            return Err(SelectError::NoTarget);
        }
        let index = mix_ip(client) as usize % targets.len();
        targets
            .keys()
            .nth(index)
            .cloned()
            .ok_or(SelectError::NoTarget)
    }
}

/// Accumulate each address octet through a multiply-rotate-xor round.
fn mix_ip(ip: IpAddr) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    let mut feed = |byte: u8| {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193).rotate_left(5);
    };
    match ip {
        IpAddr::V4(v4) => v4.octets().into_iter().for_each(&mut feed),
        IpAddr::V6(v6) => v6.octets().into_iter().for_each(&mut feed),
    }
    hash
}

/// Weighted-random selection strategy.
pub struct WeightedRandomSelector;

impl TargetSelector for WeightedRandomSelector {
    fn select(
        &self,
        _client: IpAddr,
        targets: &BTreeMap<String, u32>,
    ) -> Result<String, SelectError> {
        let total: u64 = targets.values().map(|w| u64::from(*w)).sum();
        if total == 0 {
            return Err(SelectError::NoTarget);
        }

        let draw = rand::rng().random_range(0..total);
        let mut cumulative = 0u64;
        for (address, weight) in targets {
            cumulative += u64::from(*weight);
            if draw < cumulative {
                return Ok(address.clone());
            }
        }
        Err(SelectError::NoTarget)
    }
}

/// Factory for creating the configured selection strategy
pub struct SelectorFactory;

impl SelectorFactory {
    /// Create a new selection strategy based on configuration
    pub fn create_strategy(strategy: SelectionStrategy) -> Box<dyn TargetSelector> {
        match strategy {
            SelectionStrategy::IpHash => IpHashSelector.boxed(),
            SelectionStrategy::WeightedRandom => WeightedRandomSelector.boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn targets(entries: &[(&str, u32)]) -> BTreeMap<String, u32> {
        entries
            .iter()
            .map(|(a, w)| (a.to_string(), *w))
            .collect()
    }

    #[test]
    fn ip_hash_is_deterministic() {
        let selector = IpHashSelector;
        let set = targets(&[("10.0.0.1:80", 1), ("10.0.0.2:80", 1)]);
        let client = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

        let first = selector.select(client, &set).unwrap();
        let second = selector.select(client, &set).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ip_hash_empty_targets() {
        let selector = IpHashSelector;
        let client = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(
            selector.select(client, &BTreeMap::new()),
            Err(SelectError::NoTarget)
        );
    }

    #[test]
    fn weighted_random_zero_weight_targets() {
        let selector = WeightedRandomSelector;
        let client = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(
            selector.select(client, &targets(&[("a", 0), ("b", 0)])),
            Err(SelectError::NoTarget)
        );
        assert_eq!(
            selector.select(client, &BTreeMap::new()),
            Err(SelectError::NoTarget)
        );
    }

    #[test]
    fn weighted_random_respects_single_target() {
        let selector = WeightedRandomSelector;
        let client = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let set = targets(&[("only:80", 3)]);
        assert_eq!(selector.select(client, &set).unwrap(), "only:80");
    }

    #[test]
    fn factory_builds_both_strategies() {
        let set = targets(&[("a", 1), ("b", 1)]);
        let client = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

        let hash = SelectorFactory::create_strategy(SelectionStrategy::IpHash);
        assert!(hash.select(client, &set).is_ok());

        let random = SelectorFactory::create_strategy(SelectionStrategy::WeightedRandom);
        assert!(random.select(client, &set).is_ok());
    }
}
