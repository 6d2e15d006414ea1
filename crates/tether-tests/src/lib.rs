//! Integration test crate for Tether.
//!
//! This crate exists solely to hold cross-crate integration tests.
//! It drives the bridge through a simulated native library.

#[cfg(test)]
mod fixtures;

#[cfg(test)]
mod no_leak;

#[cfg(test)]
mod release;

#[cfg(test)]
mod resize;

#[cfg(test)]
mod stress;


#[cfg(test)]
mod collector;
