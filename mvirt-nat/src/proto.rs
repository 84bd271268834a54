//! Generated protobuf types for the NAT plugin service.

#![allow(clippy::enum_variant_names)]

pub mod nat {
    tonic::include_proto!("mvirt.nat");
}

pub use nat::*;
