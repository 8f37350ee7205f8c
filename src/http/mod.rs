//! Request/response file transfer (HTTP) command family.

pub mod commands;
