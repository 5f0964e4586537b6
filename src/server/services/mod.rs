pub mod client_services;
pub mod epg_services;
pub mod manager_services;
pub mod playlist_services;
pub mod provider_services;
pub mod rule_services;
pub mod signer_services;
pub mod stream_services;
