//! CLI subcommand implementations for comb-forensics

pub mod calibrate;
pub mod config;
pub mod home;
pub mod inspect;
pub mod ledger;
pub mod manifest;
pub mod output;
pub mod run;
pub mod verify;
