pub mod api;
pub mod config;
pub mod constants;
pub mod domain;
pub mod fs;
pub mod logger;

pub mod network {
    pub mod domainspec;
    pub mod istio;
    pub mod link;
    pub mod names;
    pub mod netns;
    pub mod setup;
}
