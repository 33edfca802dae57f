pub mod abi;
pub mod connection;
pub mod contracts;
pub mod feed;

#[cfg(test)]
pub mod fake;
