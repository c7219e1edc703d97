pub mod asset;
pub mod derivative;
