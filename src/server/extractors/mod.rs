mod client_authentication_extractor;

pub use client_authentication_extractor::*;
