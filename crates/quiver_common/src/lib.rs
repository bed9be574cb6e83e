#![allow(dead_code)]

pub mod config;
pub mod data;
pub mod pretty_print;
pub mod progress_ui;
