#![forbid(unsafe_code)]

pub mod apkg;
pub mod app;
pub mod auth;
pub mod cards;
pub mod cli;
pub mod coerce;
pub mod commands;
pub mod concept_map;
pub mod deck;
pub mod error;
pub mod extract;
pub mod gemini;
pub mod graph;
pub mod logging;
pub mod pipeline;
pub mod store;
