pub use primitive_types::H256;

pub type Epoch = u64;
pub type Gwei = u64;
pub type Slot = u64;
pub type ValidatorIndex = u64;

// Sums of effective balances over every validator set would overflow `Gwei`.
pub type Weight = u128;
pub type WeightDelta = i128;
