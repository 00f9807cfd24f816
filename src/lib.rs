//! Workspace root crate. Carries no runtime code of its own — it exists so
//! `tests/integration/*.rs` can declare `[[test]]` entries against real
//! `broker`/`peer` dev-dependencies, matching the teacher's root-crate
//! integration-test layout.
