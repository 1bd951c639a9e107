use crate::primitives::Epoch;

pub const GENESIS_EPOCH: Epoch = 0;
