//! The same behavioral suite, once per switching backend.

#[macro_use]
mod common;

backend_tests!(fast, scx_contexts::BackendChoice::Fast);
backend_tests!(portable, scx_contexts::BackendChoice::Portable);
