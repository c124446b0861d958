//! Default implementations of [crate::backend::Connector]

pub mod tcp;
pub mod udp;
