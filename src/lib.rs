//! Post tool diagnostics that land on a change as review comments.
//!
//! The pipeline is: parse a unified diff into a [`git::DiffHunkIndex`],
//! classify diagnostics against it with [`filter::DiagnosticFilter`], then
//! buffer them in a [`comment::CommentService`] and flush once. Flushing
//! lists what the review already has and only creates what is missing.

pub mod backend;
pub mod comment;
pub mod config;
pub mod diagnostic;
pub mod filter;
pub mod git;
pub mod local;
