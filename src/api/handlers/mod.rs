//! API handlers grouped by surface.
//!
//! `auth` holds the end-user account-security flows, `orders` the order, payment, wallet and
//! VPS endpoints, `admin` the back-office, and `robot` the signed integration webhook. Wire
//! projections shared between them live in `dto`.

pub mod admin;
pub mod auth;
pub mod dto;
pub mod health;
pub mod orders;
pub mod robot;
