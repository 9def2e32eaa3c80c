//! Genesis bootstrap: seeding the empty DAG

use polaris_core::AcceptanceService;
use polaris_primitives::{Address, H256};
use polaris_storage::{AddressStore, TipService};
use polaris_types::{CheckpointBlock, CheckpointCache, GenesisObservation, ParentRef};
use thiserror::Error;

/// Genesis error types
#[derive(Debug, Error)]
pub enum GenesisError {
    /// The DAG already contains blocks
    #[error("genesis already initialized")]
    AlreadyInitialized,
}

/// Builds the genesis observation and seeds the DAG with it: the genesis
/// block plus two empty children, both registered as the initial tips.
pub struct GenesisBuilder {
    alloc: Vec<(Address, u64)>,
}

impl GenesisBuilder {
    /// Create a builder with the configured initial allocations
    pub fn new(alloc: Vec<(Address, u64)>) -> Self {
        Self { alloc }
    }

    /// Build the three genesis blocks without touching any state
    pub fn build(&self) -> GenesisObservation {
        let genesis = CheckpointBlock::new(
            vec![],
            vec![],
            vec![],
            vec![],
            vec![H256::ZERO],
        );
        let parent = ParentRef {
            soe_hash: genesis.soe_hash(),
            base_hash: genesis.base_hash(),
        };
        let child = |marker: u8| {
            CheckpointBlock::new(
                vec![],
                vec![parent],
                vec![],
                vec![],
                vec![H256::from_bytes([marker; 32])],
            )
        };
        GenesisObservation {
            initial_distribution: child(1),
            initial_distribution2: child(2),
            genesis,
        }
    }

    /// Seed the DAG, tips, and balances from a genesis observation
    pub fn apply(
        &self,
        observation: &GenesisObservation,
        acceptance: &AcceptanceService,
        tips: &TipService,
        addresses: &AddressStore,
    ) -> Result<(), GenesisError> {
        if !tips.is_empty() {
            return Err(GenesisError::AlreadyInitialized);
        }

        acceptance.seed(CheckpointCache::with_height(observation.genesis.clone(), 0));
        for child in [
            &observation.initial_distribution,
            &observation.initial_distribution2,
        ] {
            let cache = CheckpointCache::with_height(child.clone(), 1);
            acceptance.seed(cache.clone());
            tips.update(&cache);
        }

        for (address, amount) in &self.alloc {
            addresses.credit(*address, *amount as i128);
        }

        tracing::info!(
            allocations = self.alloc.len(),
            "genesis state initialized"
        );
        Ok(())
    }
}
