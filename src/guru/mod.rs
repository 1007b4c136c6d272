//! Built-in network gurus

pub mod guest;

pub use guest::GuestNetworkGuru;
