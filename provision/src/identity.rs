//! VM identity allocation.
//!
//! Identities for a run are reserved as one contiguous block against a single
//! inventory snapshot taken once per run. No per-call re-query happens, so a
//! batch can never interleave with a later allocation from the same run.

use crate::config::{IdentityConfig, IdentityPolicy};
use crate::error::ProvisionError;
use crate::hypervisor::VmId;
use std::collections::BTreeSet;

/// First identity at or above `floor` that is not in `existing`.
pub fn next_identity(existing: &BTreeSet<VmId>, floor: VmId) -> Result<VmId, ProvisionError> {
	(floor..=VmId::MAX)
		.find(|id| !existing.contains(id))
		.ok_or(ProvisionError::IdentitySpaceExhausted { floor, count: 1 })
}

/// Lowest contiguous run of `count` free identities at or above `floor`.
pub fn allocate_block(
	existing: &BTreeSet<VmId>,
	floor: VmId,
	count: usize,
) -> Result<Vec<VmId>, ProvisionError> {
	let exhausted = || ProvisionError::IdentitySpaceExhausted { floor, count };
	if count == 0 {
		return Ok(Vec::new());
	}
	let span = VmId::try_from(count - 1).map_err(|_| exhausted())?;
	let mut start = next_identity(existing, floor).map_err(|_| exhausted())?;
	loop {
		let end = start.checked_add(span).ok_or_else(exhausted)?;
		// Jump past the highest collision inside the candidate window.
		match existing.range(start..=end).next_back() {
			None => return Ok((start..=end).collect()),
			Some(&taken) => {
				let after = taken.checked_add(1).ok_or_else(exhausted)?;
				start = next_identity(existing, after).map_err(|_| exhausted())?;
			}
		}
	}
}

/// Control identity first, then one per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentities {
	pub control: VmId,
	pub workers: Vec<VmId>,
}

/// Resolves identities for the whole run from one inventory snapshot.
///
/// The template identity is treated as taken even when the template does not
/// exist yet, since it is created under that identity.
pub fn resolve(
	config: &IdentityConfig,
	snapshot: &BTreeSet<VmId>,
	template: VmId,
	workers: usize,
) -> Result<NodeIdentities, ProvisionError> {
	let mut taken = snapshot.clone();
	taken.insert(template);
	match config.policy {
		IdentityPolicy::Auto => {
			let block = allocate_block(&taken, config.floor, workers + 1)?;
			Ok(NodeIdentities {
				control: block[0],
				workers: block[1..].to_vec(),
			})
		}
		IdentityPolicy::Fixed => {
			let control = config
				.control
				.ok_or_else(|| ProvisionError::Config("identity.control is not set".to_owned()))?;
			if config.workers.len() != workers {
				return Err(ProvisionError::Config(format!(
					"{} fixed worker ids for {} workers",
					config.workers.len(),
					workers
				)));
			}
			let mut planned = BTreeSet::new();
			for &id in std::iter::once(&control).chain(config.workers.iter()) {
				if taken.contains(&id) || !planned.insert(id) {
					return Err(ProvisionError::IdentityCollision(id));
				}
			}
			Ok(NodeIdentities {
				control,
				workers: config.workers.clone(),
			})
		}
	}
}
