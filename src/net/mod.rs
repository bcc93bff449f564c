pub mod p2p;
pub mod protocol;
pub mod sync;
