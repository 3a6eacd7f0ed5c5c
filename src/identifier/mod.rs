pub mod ark;

pub use ark::Ark;
