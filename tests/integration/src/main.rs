mod helpers;

mod basic_operations;
mod batch;
mod config;
