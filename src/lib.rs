//! Keeps a bearer token for a challenge-protected web app fresh.
//!
//! [`manager::TokenManager`] serves a cached token while it is valid and
//! renews it through a browser login ([`login::LoginFlow`]) when it is not,
//! solving challenge widgets with a [`solver::ChallengeSolver`] on the way.

pub mod browser;
pub mod cache;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod duration;
pub mod error;
pub mod login;
pub mod manager;
pub mod solver;
pub mod strategy;
pub mod token;
