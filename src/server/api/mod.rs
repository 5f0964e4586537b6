pub mod health_controller;
pub mod listing_controller;
pub mod proxy_controller;
