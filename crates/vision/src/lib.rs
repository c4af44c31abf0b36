//! Line-crossing traffic counter: the counting engine and the service around
//! it.

pub mod counting;
pub mod pipeline;
