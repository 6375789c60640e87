mod common;
mod failures;
