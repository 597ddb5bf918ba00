//! Library surface of the `envd` binary crate: the HTTP router and its wire
//! envelopes, exposed so integration tests under `tests/` can build a router
//! directly instead of shelling out to a bound socket. Mirrors the
//! bin-plus-lib split the teacher uses for its own CLI entrypoint crate.

pub mod http;
pub mod wire;
