//! # Redka Server Library
//!
//! Runs the shared background work of a Redka deployment: delayed job
//! promotion, stale job recovery and batching. Workers live in the
//! applications that register handlers; one or more of these daemons keep
//! the queues moving.

pub mod app;
pub mod startup;
